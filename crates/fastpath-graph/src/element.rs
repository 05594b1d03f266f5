//! Element capability traits
//!
//! Every node implements [`Element`]. Sources additionally implement
//! [`SchedulableElement`] and elements that can hand work to a coprocessor
//! implement [`OffloadableElement`]; the graph asks for these capabilities
//! once, when the element is added.

use crate::batch::PacketBatch;
use crate::packet::{AnnoSet, Packet};
use crate::task::OffloadTask;
use fastpath_offload::CompletionTicket;
use std::fmt;
use std::time::Duration;

/// Output ports per element
pub const MAX_OUTPUTS: usize = 8;

/// Coprocessor types with their own ready queue
pub const MAX_COPROCESSOR_TYPES: usize = 4;

/// Index of an element in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub usize);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-element id of a batch absorbed into an offload task
pub type SlotId = u64;

/// What happens to a batch after `Element::process`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Whole batch to one output port
    Forward(usize),
    /// Batch to port 0, one clone per other port
    Broadcast,
    /// Route each packet by its own `PacketOut`
    Classified,
    /// Free batch and packets
    Drop,
    /// Packets now belong to someone else; free only the batch
    Consumed,
}

/// Outcome of `OffloadableElement::dispatch`
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// One completion covers the whole task
    Whole(CompletionTicket),
    /// One completion per slot, in task order
    PerSlot(Vec<CompletionTicket>),
    /// Device has no room now; keep the task and retry on the next scan
    Deferred,
    /// Device refused the task; its batches are dropped
    Failed,
}

/// Capability of an element, fixed when it is added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Plain,
    Schedulable,
    Offloadable,
}

/// A node of the processing graph
pub trait Element: Send {
    fn class_name(&self) -> &'static str;

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    /// Annotation slots this element reads
    fn annotations_read(&self) -> AnnoSet {
        AnnoSet::EMPTY
    }

    /// Annotation slots this element writes
    fn annotations_written(&self) -> AnnoSet {
        AnnoSet::EMPTY
    }

    fn process(&mut self, input_port: usize, batch: &mut PacketBatch) -> Verdict;

    fn as_schedulable_mut(&mut self) -> Option<&mut dyn SchedulableElement> {
        None
    }

    fn as_offloadable_mut(&mut self) -> Option<&mut dyn OffloadableElement> {
        None
    }
}

/// Element polled once per driver iteration for new packets
pub trait SchedulableElement: Element {
    fn poll(&mut self) -> Option<Vec<Packet>>;
}

/// Element that can aggregate batches into coprocessor tasks.
///
/// Batches the element accepts are absorbed into its open task. On each
/// scan the graph asks `ready_to_dispatch`; if yes, every not yet
/// preprocessed batch goes through `preprocess` and the task is handed to
/// `dispatch`. Once completions arrive each batch is passed to
/// `postprocess`, and after the last one `finalize` runs and the batches
/// continue from `output_port`.
pub trait OffloadableElement: Element {
    fn device_type(&self) -> usize {
        0
    }

    /// Absorb this batch instead of processing it in-line
    fn wants_offload(&self, _batch: &PacketBatch) -> bool {
        true
    }

    /// Dispatch policy over the open task
    fn ready_to_dispatch(&self, pending_batches: usize, age: Duration) -> bool;

    fn preprocess(&mut self, _batch: &mut PacketBatch) {}

    fn dispatch(&mut self, task: &mut OffloadTask) -> Dispatch;

    /// Consume results for batch `index` of `task`.
    ///
    /// The batch is lent out for the call, so `task.batch(index)` reads
    /// empty meanwhile.
    fn postprocess(&mut self, task: &OffloadTask, index: usize, batch: &mut PacketBatch);

    fn finalize(&mut self, _task: &mut OffloadTask) {}

    /// Port the batches leave on after finalization
    fn output_port(&self) -> usize {
        0
    }
}
