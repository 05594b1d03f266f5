//! Element graph scheduler
//!
//! Single-threaded and cooperative: the owning compute thread feeds batches
//! in, drains the work queue with `flush_tasks`, and polls for device
//! completions with `flush_offloaded_tasks`. Nothing here blocks on a
//! coprocessor.
//!
//! ```text
//!   enqueue_batch ──▶ queue ──step()──▶ element.process ──▶ next element
//!                       ▲                  │ offloadable
//!                       │                  ▼
//!                       │             open task ──scan──▶ preprocess + dispatch
//!                       │                                        │
//!                       └── Task ◀── flush_offloaded_tasks ◀── ready_tasks[type]
//!                             │
//!                             └─▶ postprocess per slot ─▶ finalize ─▶ output_port
//! ```

use crate::batch::PacketBatch;
use crate::element::{
    Dispatch, Element, ElementId, ElementKind, OffloadableElement, SlotId, Verdict, MAX_COPROCESSOR_TYPES,
    MAX_OUTPUTS,
};
use crate::error::{GraphError, GraphResult};
use crate::offload_state::OffloadState;
use crate::packet::{AnnoSet, Packet, PacketOut};
use crate::task::OffloadTask;
use fastpath_common::GraphConfig;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
enum WorkItem {
    Batch {
        batch: PacketBatch,
        element: ElementId,
        input_port: usize,
    },
    Task {
        task: OffloadTask,
        element: ElementId,
    },
}

struct Node {
    element: Box<dyn Element>,
    kind: ElementKind,
    class: &'static str,
    num_inputs: usize,
    reads: AnnoSet,
    writes: AnnoSet,
    outputs: Vec<Option<(ElementId, usize)>>,
    open_task: Option<OffloadTask>,
    next_slot: SlotId,
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Batches handed in through `enqueue_batch`
    pub batches_admitted: u64,
    /// Clones and per-port splits created while routing
    pub batches_spawned: u64,
    pub batches_freed: u64,
    /// Batches taken into an offload task
    pub batches_absorbed: u64,
    /// Batches handed back by a finalized task
    pub batches_resumed: u64,
    pub packets_freed: u64,
    pub packets_handed_off: u64,
    /// Packets a classifying element marked for dropping
    pub packets_dropped: u64,
    pub tasks_dispatched: u64,
    pub tasks_deferred: u64,
    pub tasks_failed: u64,
    pub tasks_released: u64,
}

impl GraphStats {
    /// Batches created but not yet freed, including those inside tasks
    pub fn live_batches(&self) -> u64 {
        (self.batches_admitted + self.batches_spawned).saturating_sub(self.batches_freed)
    }
}

/// The scheduler
pub struct ElementGraph {
    nodes: Vec<Node>,
    sched_elements: Vec<ElementId>,
    offl_elements: Vec<ElementId>,
    queue: VecDeque<WorkItem>,
    ready_tasks: [VecDeque<OffloadTask>; MAX_COPROCESSOR_TYPES],
    state: OffloadState,
    stats: GraphStats,
    next_batch_id: u64,
    next_task_id: u64,
    max_elements: usize,
    sealed: bool,
}

impl std::fmt::Debug for ElementGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementGraph")
            .field("elements", &self.nodes.iter().map(|n| n.class).collect::<Vec<_>>())
            .field("queued", &self.queue.len())
            .field("sealed", &self.sealed)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for ElementGraph {
    fn default() -> Self {
        Self::new(&GraphConfig::default())
    }
}

fn offloadable<'a>(element: &'a mut (dyn Element + 'static), class: &str) -> &'a mut (dyn OffloadableElement + 'a) {
    match element.as_offloadable_mut() {
        Some(oel) => oel,
        None => panic!("element {class} lost its offload capability"),
    }
}

impl ElementGraph {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            nodes: Vec::new(),
            sched_elements: Vec::new(),
            offl_elements: Vec::new(),
            queue: VecDeque::with_capacity(config.queue_capacity),
            ready_tasks: std::array::from_fn(|_| VecDeque::new()),
            state: OffloadState::new(),
            stats: GraphStats::default(),
            next_batch_id: 0,
            next_task_id: 0,
            max_elements: config.max_elements,
            sealed: false,
        }
    }

    // ---- construction ----

    /// Add an element; its capabilities are recorded now and never re-queried
    pub fn add_element(&mut self, element: impl Element + 'static) -> GraphResult<ElementId> {
        self.add_boxed(Box::new(element))
    }

    pub fn add_boxed(&mut self, mut element: Box<dyn Element>) -> GraphResult<ElementId> {
        if self.sealed {
            return Err(GraphError::GraphSealed);
        }
        if self.nodes.len() >= self.max_elements {
            return Err(GraphError::TooManyElements(self.nodes.len()));
        }
        let class = element.class_name();
        let num_outputs = element.num_outputs();
        if num_outputs > MAX_OUTPUTS {
            return Err(GraphError::TooManyOutputs { class, outputs: num_outputs, max: MAX_OUTPUTS });
        }

        let kind = if let Some(oel) = element.as_offloadable_mut() {
            let device_type = oel.device_type();
            if device_type >= MAX_COPROCESSOR_TYPES {
                return Err(GraphError::InvalidDeviceType { class, device_type, max: MAX_COPROCESSOR_TYPES });
            }
            ElementKind::Offloadable
        } else if element.as_schedulable_mut().is_some() {
            ElementKind::Schedulable
        } else {
            ElementKind::Plain
        };

        let id = ElementId(self.nodes.len());
        match kind {
            ElementKind::Schedulable => self.sched_elements.push(id),
            ElementKind::Offloadable => self.offl_elements.push(id),
            ElementKind::Plain => {}
        }
        self.nodes.push(Node {
            num_inputs: element.num_inputs(),
            reads: element.annotations_read(),
            writes: element.annotations_written(),
            element,
            kind,
            class,
            outputs: vec![None; num_outputs],
            open_task: None,
            next_slot: 0,
        });
        tracing::debug!(element = %id, class, ?kind, "element added");
        Ok(id)
    }

    /// Connect output `out_port` of `from` to input `in_port` of `to`
    pub fn link_element(&mut self, to: ElementId, in_port: usize, from: ElementId, out_port: usize) -> GraphResult<()> {
        if self.sealed {
            return Err(GraphError::GraphSealed);
        }
        for id in [from, to] {
            if id.0 >= self.nodes.len() {
                return Err(GraphError::InvalidElement(id));
            }
        }
        let src = &self.nodes[from.0];
        match src.outputs.get(out_port) {
            None => return Err(GraphError::InvalidOutputPort { element: from, port: out_port }),
            Some(Some(_)) => return Err(GraphError::PortAlreadyLinked { element: from, port: out_port }),
            Some(None) => {}
        }
        if in_port >= self.nodes[to.0].num_inputs {
            return Err(GraphError::InvalidInputPort { element: to, port: in_port });
        }
        if from == to || self.reaches(to, from) {
            return Err(GraphError::CycleDetected { from, to });
        }
        self.nodes[from.0].outputs[out_port] = Some((to, in_port));
        Ok(())
    }

    fn reaches(&self, src: ElementId, dst: ElementId) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![src];
        while let Some(id) = stack.pop() {
            if id == dst {
                return true;
            }
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(self.nodes[id.0].outputs.iter().flatten().map(|&(next, _)| next));
        }
        false
    }

    /// Check annotation writer/reader pairs and seal the topology.
    ///
    /// Every annotation an element reads must be written by at least one
    /// element upstream of it. The first violation in insertion order is
    /// reported.
    pub fn validate(&mut self) -> GraphResult<()> {
        if self.sched_elements.is_empty() {
            return Err(GraphError::NoEntryPoint);
        }

        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            for &(next, _) in node.outputs.iter().flatten() {
                preds[next.0].push(idx);
            }
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            if node.reads.is_empty() {
                continue;
            }
            let mut upstream = AnnoSet::EMPTY;
            let mut seen = vec![false; self.nodes.len()];
            let mut stack = preds[idx].clone();
            while let Some(p) = stack.pop() {
                if std::mem::replace(&mut seen[p], true) {
                    continue;
                }
                upstream = upstream.union(self.nodes[p].writes);
                stack.extend(preds[p].iter().copied());
            }
            if let Some(annotation) = node.reads.iter().find(|&a| !upstream.contains(a)) {
                return Err(GraphError::UnsatisfiedAnnotation { element: ElementId(idx), annotation });
            }
        }

        self.sealed = true;
        tracing::info!(
            elements = self.nodes.len(),
            entry_points = self.sched_elements.len(),
            offloadable = self.offl_elements.len(),
            "element graph sealed"
        );
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    // ---- accessors ----

    /// Number of elements
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_elements(&self) -> impl Iterator<Item = (ElementId, &dyn Element)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (ElementId(i), n.element.as_ref() as &dyn Element))
    }

    pub fn element(&self, id: ElementId) -> Option<&dyn Element> {
        self.nodes.get(id.0).map(|n| n.element.as_ref() as &dyn Element)
    }

    pub fn element_kind(&self, id: ElementId) -> Option<ElementKind> {
        self.nodes.get(id.0).map(|n| n.kind)
    }

    /// Elements polled once per iteration, in insertion order
    pub fn get_schedulable_elements(&self) -> &[ElementId] {
        &self.sched_elements
    }

    pub fn get_offloadable_elements(&self) -> &[ElementId] {
        &self.offl_elements
    }

    pub fn get_entry_point(&self, idx: usize) -> Option<ElementId> {
        self.sched_elements.get(idx).copied()
    }

    /// Target of `port` of `id`
    pub fn next_of(&self, id: ElementId, port: usize) -> Option<(ElementId, usize)> {
        self.nodes.get(id.0)?.outputs.get(port).copied().flatten()
    }

    /// Element on output port 0
    pub fn get_first_next(&self, id: ElementId) -> Option<ElementId> {
        self.next_of(id, 0).map(|(next, _)| next)
    }

    /// Whether the element on output port 0 can offload
    pub fn check_next_offloadable(&self, id: ElementId) -> bool {
        self.get_first_next(id)
            .is_some_and(|next| self.nodes[next.0].kind == ElementKind::Offloadable)
    }

    /// Work items waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Tasks still aggregating batches
    pub fn open_tasks(&self) -> usize {
        self.nodes.iter().filter(|n| n.open_task.is_some()).count()
    }

    /// Tasks dispatched and waiting for completions
    pub fn pending_tasks(&self) -> usize {
        self.ready_tasks.iter().map(VecDeque::len).sum()
    }

    /// Nothing queued, aggregating or in flight
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.open_tasks() == 0 && self.pending_tasks() == 0
    }

    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn offload_state(&self) -> &OffloadState {
        &self.state
    }

    // ---- offload gates ----

    pub fn check_preproc(&self, element: ElementId, slot: SlotId) -> bool {
        self.state.check_preproc(element, slot)
    }

    pub fn check_postproc(&self, element: ElementId, slot: SlotId) -> bool {
        self.state.check_postproc(element, slot)
    }

    pub fn check_postproc_all(&self, element: ElementId) -> bool {
        self.state.check_postproc_all(element)
    }

    // ---- run time ----

    /// Ask a schedulable element for new packets
    pub fn poll_schedulable(&mut self, id: ElementId) -> Option<Vec<Packet>> {
        let node = self.nodes.get_mut(id.0)?;
        node.element.as_schedulable_mut()?.poll()
    }

    /// Queue a batch at `start` without running it
    pub fn enqueue_batch(&mut self, mut batch: PacketBatch, start: ElementId, input_port: usize) {
        self.assert_target(start, input_port);
        self.next_batch_id += 1;
        batch.set_id(self.next_batch_id);
        self.stats.batches_admitted += 1;
        self.queue.push_back(WorkItem::Batch { batch, element: start, input_port });
    }

    /// Queue a dispatched task for postprocessing at its owning element
    pub fn enqueue_offload_task(&mut self, task: OffloadTask, start: ElementId, input_port: usize) {
        assert_eq!(task.element(), start, "task {} resumed at a foreign element", task.id());
        assert_eq!(task.input_port(), input_port, "task {} resumed on another input port", task.id());
        self.queue.push_back(WorkItem::Task { task, element: start });
    }

    /// Drain the work queue; returns the number of items processed
    pub fn flush_tasks(&mut self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
        }
        steps
    }

    /// Process one queued item: one element hop for a batch, or one
    /// postprocessing pass for a task. False when the queue was empty.
    pub fn step(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(WorkItem::Batch { batch, element, input_port }) => self.process_batch(batch, element, input_port),
            Some(WorkItem::Task { task, element }) => self.process_offload_task(task, element),
            None => return false,
        }
        true
    }

    /// Dispatch every open task whose element says it is ready
    pub fn scan_offloadable_elements(&mut self) -> usize {
        let mut dispatched = 0;
        for i in 0..self.offl_elements.len() {
            let eid = self.offl_elements[i];
            let node = &mut self.nodes[eid.0];
            let Some(mut task) = node.open_task.take() else {
                continue;
            };
            let oel = offloadable(node.element.as_mut(), node.class);
            if !oel.ready_to_dispatch(task.len(), task.age()) {
                node.open_task = Some(task);
                continue;
            }

            for idx in 0..task.len() {
                let slot = task.slot(idx);
                if self.state.check_preproc(eid, slot) {
                    oel.preprocess(task.batch_mut(idx));
                    self.state.mark_preproc(eid, slot);
                }
            }

            let outcome = oel.dispatch(&mut task);
            let tickets = match outcome {
                Dispatch::Whole(ticket) => vec![ticket; task.len()],
                Dispatch::PerSlot(tickets) => tickets,
                Dispatch::Deferred => {
                    self.stats.tasks_deferred += 1;
                    tracing::debug!(element = %eid, task_id = task.id(), "dispatch deferred");
                    self.nodes[eid.0].open_task = Some(task);
                    continue;
                }
                Dispatch::Failed => {
                    tracing::warn!(element = %eid, task_id = task.id(), batches = task.len(), "dispatch failed, dropping task");
                    self.drop_task(task);
                    continue;
                }
            };

            for (idx, ticket) in tickets.iter().enumerate() {
                self.state.attach_ticket(eid, task.slot(idx), ticket.clone());
            }
            task.set_dispatched(tickets);
            self.stats.tasks_dispatched += 1;
            dispatched += 1;
            tracing::debug!(
                element = %eid,
                task_id = task.id(),
                batches = task.len(),
                packets = task.num_packets(),
                "task dispatched"
            );
            self.ready_tasks[task.device_type()].push_back(task);
        }
        dispatched
    }

    /// Move tasks with new completions (or a failed device) to the work
    /// queue. Never blocks.
    pub fn flush_offloaded_tasks(&mut self) -> usize {
        let mut moved = 0;
        for dt in 0..MAX_COPROCESSOR_TYPES {
            for _ in 0..self.ready_tasks[dt].len() {
                let Some(task) = self.ready_tasks[dt].pop_front() else {
                    break;
                };
                let eid = task.element();
                let progress = task
                    .slots()
                    .iter()
                    .any(|&s| self.state.check_postproc(eid, s) || self.state.is_failed(eid, s));
                if progress {
                    let input_port = task.input_port();
                    self.enqueue_offload_task(task, eid, input_port);
                    moved += 1;
                } else {
                    self.ready_tasks[dt].push_back(task);
                }
            }
        }
        moved
    }

    /// Release a batch that leaves the graph. `free_pkts` is false when the
    /// packets were handed to another owner.
    pub fn free_batch(&mut self, batch: PacketBatch, free_pkts: bool) {
        self.stats.batches_freed += 1;
        if free_pkts {
            self.stats.packets_freed += batch.len() as u64;
        } else {
            self.stats.packets_handed_off += batch.len() as u64;
        }
        drop(batch);
    }

    // ---- internals ----

    fn assert_target(&self, element: ElementId, input_port: usize) {
        let node = match self.nodes.get(element.0) {
            Some(node) => node,
            None => panic!("no element {element}"),
        };
        assert!(input_port < node.num_inputs, "element {element} has no input port {input_port}");
    }

    fn process_batch(&mut self, mut batch: PacketBatch, eid: ElementId, input_port: usize) {
        let node = &mut self.nodes[eid.0];
        if node.kind == ElementKind::Offloadable && offloadable(node.element.as_mut(), node.class).wants_offload(&batch) {
            self.absorb(eid, input_port, batch);
            return;
        }
        let verdict = node.element.process(input_port, &mut batch);
        self.route(eid, batch, verdict);
    }

    fn absorb(&mut self, eid: ElementId, input_port: usize, batch: PacketBatch) {
        let node = &mut self.nodes[eid.0];
        let slot = node.next_slot;
        node.next_slot += 1;
        if node.open_task.is_none() {
            self.next_task_id += 1;
            let device_type = offloadable(node.element.as_mut(), node.class).device_type();
            node.open_task = Some(OffloadTask::new(self.next_task_id, eid, device_type, input_port));
        }
        if let Some(task) = node.open_task.as_mut() {
            task.absorb(batch, slot);
        }
        self.state.register(eid, slot);
        self.stats.batches_absorbed += 1;
    }

    fn route(&mut self, eid: ElementId, mut batch: PacketBatch, verdict: Verdict) {
        match verdict {
            Verdict::Forward(port) => self.forward(eid, port, batch, true),
            Verdict::Broadcast => {
                for port in 1..self.nodes[eid.0].outputs.len() {
                    if let Some((to, input_port)) = self.next_of(eid, port) {
                        let clone = self.spawn(batch.packets().to_vec());
                        self.queue.push_back(WorkItem::Batch { batch: clone, element: to, input_port });
                    }
                }
                self.forward(eid, 0, batch, true);
            }
            Verdict::Classified => {
                let mut groups: BTreeMap<usize, Vec<Packet>> = BTreeMap::new();
                for mut pkt in batch.take_packets() {
                    match pkt.output() {
                        PacketOut::Port(port) => {
                            pkt.reset_output();
                            groups.entry(port).or_default().push(pkt);
                        }
                        PacketOut::Drop => self.stats.packets_dropped += 1,
                    }
                }
                let mut groups = groups.into_iter();
                match groups.next() {
                    None => self.free_batch(batch, true),
                    Some((first, packets)) => {
                        batch.set_packets(packets);
                        for (port, packets) in groups {
                            let split = self.spawn(packets);
                            self.forward(eid, port, split, false);
                        }
                        self.forward(eid, first, batch, true);
                    }
                }
            }
            Verdict::Drop => self.free_batch(batch, true),
            Verdict::Consumed => self.free_batch(batch, false),
        }
    }

    fn spawn(&mut self, packets: Vec<Packet>) -> PacketBatch {
        let mut batch = PacketBatch::new(packets);
        self.next_batch_id += 1;
        batch.set_id(self.next_batch_id);
        self.stats.batches_spawned += 1;
        batch
    }

    /// In-line continuation goes to the front, everything else to the back
    fn forward(&mut self, eid: ElementId, port: usize, batch: PacketBatch, inline: bool) {
        match self.next_of(eid, port) {
            Some((element, input_port)) => {
                let item = WorkItem::Batch { batch, element, input_port };
                if inline {
                    self.queue.push_front(item);
                } else {
                    self.queue.push_back(item);
                }
            }
            None => self.free_batch(batch, true),
        }
    }

    fn process_offload_task(&mut self, mut task: OffloadTask, eid: ElementId) {
        debug_assert_eq!(task.element(), eid);
        self.state.begin_task(eid, task.slots());
        if task.slots().iter().any(|&s| self.state.is_failed(eid, s)) {
            tracing::warn!(element = %eid, task_id = task.id(), batches = task.len(), "device failed, dropping task");
            self.drop_task(task);
            return;
        }

        let node = &mut self.nodes[eid.0];
        let oel = offloadable(node.element.as_mut(), node.class);
        for idx in 0..task.len() {
            let slot = task.slot(idx);
            if self.state.check_postproc(eid, slot) {
                let mut batch = task.lend_batch(idx);
                oel.postprocess(&task, idx, &mut batch);
                task.return_batch(idx, batch);
                self.state.mark_postproc(eid, slot);
            }
        }

        if self.state.check_postproc_all(eid) {
            self.finalize_task(task);
        } else {
            self.ready_tasks[task.device_type()].push_back(task);
        }
    }

    fn finalize_task(&mut self, mut task: OffloadTask) {
        let eid = task.element();
        self.state.finalize(eid);

        let node = &mut self.nodes[eid.0];
        let oel = offloadable(node.element.as_mut(), node.class);
        oel.finalize(&mut task);
        let next = node.outputs.get(oel.output_port()).copied().flatten();

        self.stats.tasks_released += 1;
        tracing::debug!(element = %eid, task_id = task.id(), batches = task.len(), "task released");
        for batch in task.into_batches() {
            self.stats.batches_resumed += 1;
            match next {
                Some((element, input_port)) => self.queue.push_back(WorkItem::Batch { batch, element, input_port }),
                None => self.free_batch(batch, true),
            }
        }
    }

    fn drop_task(&mut self, task: OffloadTask) {
        self.state.discard(task.element(), task.slots());
        self.stats.tasks_failed += 1;
        for batch in task.into_batches() {
            self.free_batch(batch, true);
        }
    }
}
