//! Per-slot offload bookkeeping
//!
//! Keyed by `(element, slot)` rather than by task so slots can complete in
//! any order. Flag transitions are contract checks: breaking one is a bug
//! in the scheduler, so it panics.

use crate::element::{ElementId, SlotId};
use fastpath_offload::CompletionTicket;
use std::collections::{HashMap, HashSet};

pub const PREPROC: u8 = 1;
pub const POSTPROC: u8 = 2;
pub const POSTPROC_FIN: u8 = 4;

#[derive(Debug, Default)]
struct SlotState {
    flags: u8,
    ticket: Option<CompletionTicket>,
}

/// Offload progress of every absorbed batch
#[derive(Debug, Default)]
pub struct OffloadState {
    actions: HashMap<(ElementId, SlotId), SlotState>,
    current: HashMap<ElementId, Vec<SlotId>>,
    finalized: HashSet<ElementId>,
}

impl OffloadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracked slots across all elements
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn flags(&self, element: ElementId, slot: SlotId) -> Option<u8> {
        self.actions.get(&(element, slot)).map(|s| s.flags)
    }

    pub fn register(&mut self, element: ElementId, slot: SlotId) {
        let prev = self.actions.insert((element, slot), SlotState::default());
        assert!(prev.is_none(), "slot {slot} of element {element} registered twice");
    }

    pub fn check_preproc(&self, element: ElementId, slot: SlotId) -> bool {
        matches!(self.flags(element, slot), Some(f) if f & PREPROC == 0)
    }

    pub fn check_postproc(&self, element: ElementId, slot: SlotId) -> bool {
        match self.actions.get(&(element, slot)) {
            Some(s) => {
                s.flags & PREPROC != 0
                    && s.flags & POSTPROC == 0
                    && s.ticket.as_ref().is_some_and(CompletionTicket::is_ready)
            }
            None => false,
        }
    }

    /// True when the element's current task has every slot postprocessed,
    /// or that task has already been finalized
    pub fn check_postproc_all(&self, element: ElementId) -> bool {
        if self.finalized.contains(&element) {
            return true;
        }
        match self.current.get(&element) {
            Some(slots) if !slots.is_empty() => slots
                .iter()
                .all(|&s| self.flags(element, s).is_some_and(|f| f & POSTPROC != 0)),
            _ => false,
        }
    }

    /// A slot whose completion can never arrive
    pub fn is_failed(&self, element: ElementId, slot: SlotId) -> bool {
        match self.actions.get(&(element, slot)) {
            Some(s) => s.flags & POSTPROC == 0 && s.ticket.as_ref().is_some_and(CompletionTicket::is_failed),
            None => false,
        }
    }

    pub fn mark_preproc(&mut self, element: ElementId, slot: SlotId) {
        let s = self.slot_mut(element, slot);
        assert!(s.flags & PREPROC == 0, "slot {slot} of element {element} preprocessed twice");
        s.flags |= PREPROC;
    }

    pub fn attach_ticket(&mut self, element: ElementId, slot: SlotId, ticket: CompletionTicket) {
        let s = self.slot_mut(element, slot);
        assert!(s.flags & PREPROC != 0, "slot {slot} of element {element} dispatched before preproc");
        s.ticket = Some(ticket);
    }

    pub fn mark_postproc(&mut self, element: ElementId, slot: SlotId) {
        let s = self.slot_mut(element, slot);
        assert!(s.flags & PREPROC != 0, "slot {slot} of element {element} postprocessed before preproc");
        assert!(s.flags & POSTPROC == 0, "slot {slot} of element {element} postprocessed twice");
        s.flags |= POSTPROC;
    }

    /// Make `slots` the element's current task
    pub fn begin_task(&mut self, element: ElementId, slots: &[SlotId]) {
        self.finalized.remove(&element);
        self.current.insert(element, slots.to_vec());
    }

    /// Mark every slot of the current task finalized and forget them
    pub fn finalize(&mut self, element: ElementId) {
        assert!(self.check_postproc_all(element), "element {element} finalized with slots outstanding");
        if let Some(slots) = self.current.remove(&element) {
            for slot in slots {
                self.slot_mut(element, slot).flags |= POSTPROC_FIN;
                self.actions.remove(&(element, slot));
            }
        }
        self.finalized.insert(element);
    }

    pub fn is_finalized(&self, element: ElementId) -> bool {
        self.finalized.contains(&element)
    }

    /// Forget slots whose batches were dropped
    pub fn discard(&mut self, element: ElementId, slots: &[SlotId]) {
        for slot in slots {
            self.actions.remove(&(element, *slot));
        }
        if let Some(current) = self.current.get(&element) {
            if current.iter().any(|s| slots.contains(s)) {
                self.current.remove(&element);
            }
        }
    }

    fn slot_mut(&mut self, element: ElementId, slot: SlotId) -> &mut SlotState {
        match self.actions.get_mut(&(element, slot)) {
            Some(s) => s,
            None => panic!("unknown slot {slot} of element {element}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastpath_offload::PollRing;
    use std::sync::Arc;

    const E: ElementId = ElementId(2);

    fn ticket(ring: &Arc<PollRing>, slot: usize) -> CompletionTicket {
        CompletionTicket::new(ring.clone(), slot, 1, slot as u64)
    }

    #[test]
    fn test_slot_lifecycle() {
        let ring = Arc::new(PollRing::new(2, 0));
        let mut state = OffloadState::new();
        state.register(E, 0);
        assert!(state.check_preproc(E, 0));
        assert!(!state.check_postproc(E, 0));

        state.mark_preproc(E, 0);
        assert!(!state.check_preproc(E, 0));
        state.attach_ticket(E, 0, ticket(&ring, 0));
        assert!(!state.check_postproc(E, 0));
        ring.post(0, 1);
        assert!(state.check_postproc(E, 0));

        state.begin_task(E, &[0]);
        assert!(!state.check_postproc_all(E));
        state.mark_postproc(E, 0);
        assert!(state.check_postproc_all(E));
        state.finalize(E);
        assert!(state.is_finalized(E));
        assert!(state.check_postproc_all(E));
        assert!(state.is_empty());
    }

    #[test]
    fn test_unknown_slot_is_not_eligible() {
        let state = OffloadState::new();
        assert!(!state.check_preproc(E, 9));
        assert!(!state.check_postproc(E, 9));
        assert!(!state.check_postproc_all(E));
    }

    #[test]
    #[should_panic(expected = "postprocessed before preproc")]
    fn test_postproc_before_preproc_panics() {
        let mut state = OffloadState::new();
        state.register(E, 0);
        state.mark_postproc(E, 0);
    }

    #[test]
    #[should_panic(expected = "unknown slot")]
    fn test_flag_on_unknown_slot_panics() {
        let mut state = OffloadState::new();
        state.mark_preproc(E, 4);
    }

    #[test]
    #[should_panic(expected = "slots outstanding")]
    fn test_early_finalize_panics() {
        let mut state = OffloadState::new();
        state.register(E, 0);
        state.register(E, 1);
        state.mark_preproc(E, 0);
        state.mark_preproc(E, 1);
        state.begin_task(E, &[0, 1]);
        state.mark_postproc(E, 0);
        state.finalize(E);
    }

    #[test]
    fn test_new_task_clears_finalized() {
        let mut state = OffloadState::new();
        state.register(E, 0);
        state.mark_preproc(E, 0);
        state.begin_task(E, &[0]);
        state.mark_postproc(E, 0);
        state.finalize(E);

        state.register(E, 1);
        state.mark_preproc(E, 1);
        state.begin_task(E, &[1]);
        assert!(!state.is_finalized(E));
        assert!(!state.check_postproc_all(E));
    }

    #[test]
    fn test_failed_ring_marks_slot_failed() {
        let ring = Arc::new(PollRing::new(1, 0));
        let mut state = OffloadState::new();
        state.register(E, 0);
        state.mark_preproc(E, 0);
        state.attach_ticket(E, 0, ticket(&ring, 0));
        assert!(!state.is_failed(E, 0));
        ring.mark_failed();
        assert!(state.is_failed(E, 0));
        state.discard(E, &[0]);
        assert!(state.is_empty());
    }
}
