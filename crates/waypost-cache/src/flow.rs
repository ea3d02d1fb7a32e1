//! # Flows
//!
//! A flow is the interface abstraction: an ingress subq (traffic arriving
//! from the interface), an egress subq (traffic to be transmitted by the
//! interface), and two state-flag words. External callers set bits in the
//! *pending* word via `flow_modify_flags`; the scheduler later folds pending
//! into *current* and derives up/down/poll events from the combined change.
//!
//! The cache itself lives behind a flow block, so the scheduler reaches it
//! exactly like any convergence-layer interface.

use std::collections::VecDeque;

use crate::pool::BlockId;
use crate::subq::SubqWork;

/// Administratively enabled (operator intent).
pub const FLOW_FLAG_ADMIN_UP: u32 = 0x01;
/// Operationally up (interface reports a live peer).
pub const FLOW_FLAG_OPER_UP: u32 = 0x02;
/// One-shot poll request; produces a poll event when folded in.
pub const FLOW_FLAG_POLL: u32 = 0x04;

/// Events derived from a state-flag fold, dispatched by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Up,
    Down,
    Poll,
}

/// Pool-resident flow block.
#[derive(Debug, Default)]
pub struct FlowBlock {
    pub ingress: SubqWork,
    pub egress: SubqWork,
    pub current_flags: u32,
    pub pending_flags: u32,
    /// Set when this flow's job needs a scheduler pass.
    pub job_active: bool,
    /// Cache entries awaiting FSM reevaluation. Only the storage flow uses
    /// this; it stays empty on interface flows.
    pub pending_entries: VecDeque<BlockId>,
}

impl FlowBlock {
    pub fn new(ingress_limit: u32, egress_limit: u32) -> Self {
        FlowBlock {
            ingress: SubqWork::new(ingress_limit),
            egress: SubqWork::new(egress_limit),
            ..Default::default()
        }
    }

    /// A flow forwards traffic only when both up bits are set.
    pub fn is_up(&self) -> bool {
        const UP: u32 = FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP;
        self.current_flags & UP == UP
    }

    /// Record a requested state change; the fold happens on the scheduler.
    /// Callers go through the pool so the flow's job also gets activated.
    pub fn modify_flags(&mut self, set: u32, clear: u32) {
        self.pending_flags |= set;
        self.pending_flags &= !clear;
    }

    /// Fold pending flags into current and derive the resulting events.
    ///
    /// Up/down detection is a function of the combined flag bits, not of any
    /// single changed bit.
    pub fn fold_state(&mut self) -> Vec<FlowEvent> {
        let was_up = self.is_up();
        let changed = self.pending_flags ^ self.current_flags;
        self.current_flags ^= changed & !FLOW_FLAG_POLL;
        // Poll is one-shot: consume the request without latching the bit.
        let polled = self.pending_flags & FLOW_FLAG_POLL != 0;
        self.pending_flags &= !FLOW_FLAG_POLL;
        let is_up = self.is_up();

        let mut events = Vec::new();
        if was_up != is_up {
            events.push(if is_up { FlowEvent::Up } else { FlowEvent::Down });
        }
        if polled {
            events.push(FlowEvent::Poll);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_requires_both_bits() {
        let mut flow = FlowBlock::new(4, 4);
        flow.modify_flags(FLOW_FLAG_ADMIN_UP, 0);
        assert_eq!(flow.fold_state(), vec![]);
        assert!(!flow.is_up());

        flow.modify_flags(FLOW_FLAG_OPER_UP, 0);
        assert_eq!(flow.fold_state(), vec![FlowEvent::Up]);
        assert!(flow.is_up());
    }

    #[test]
    fn dropping_either_bit_takes_the_flow_down() {
        let mut flow = FlowBlock::new(4, 4);
        flow.modify_flags(FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP, 0);
        flow.fold_state();

        flow.modify_flags(0, FLOW_FLAG_OPER_UP);
        assert_eq!(flow.fold_state(), vec![FlowEvent::Down]);
        assert!(!flow.is_up());
    }

    #[test]
    fn poll_is_one_shot() {
        let mut flow = FlowBlock::new(4, 4);
        flow.modify_flags(FLOW_FLAG_POLL, 0);
        assert_eq!(flow.fold_state(), vec![FlowEvent::Poll]);
        assert_eq!(flow.fold_state(), vec![]);
    }

    #[test]
    fn redundant_changes_produce_no_events() {
        let mut flow = FlowBlock::new(4, 4);
        flow.modify_flags(FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP, 0);
        flow.fold_state();
        flow.modify_flags(FLOW_FLAG_ADMIN_UP, 0);
        assert_eq!(flow.fold_state(), vec![]);
    }
}


