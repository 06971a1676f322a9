// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Arena of live evaluations.
//!
//! Every evaluation registers a `Slot` for its lifetime. Slots reference
//! their parent and child by id, never by pointer, so the tree can be walked
//! from any task holding the sequencer lock. The registry is plain data; all
//! synchronization belongs to `Sequencer`.

use super::phase::Phase;
use hsvm_kernel::EventId;
use std::collections::BTreeMap;

pub type EvalId = u64;

#[derive(Clone, Debug)]
pub struct Slot {
    pub id: EvalId,
    pub parent: Option<EvalId>,
    pub child: Option<EvalId>,
    pub phase: Phase,
    pub event_id: Option<EventId>,
    /// Zero until acquired.
    pub sequence: u64,
    /// Root of the commit group this slot staged into, when not its own.
    pub group: Option<EvalId>,
    /// Highest sequence staged into this slot's transaction by members.
    pub high_water: u64,
    pub committed: bool,
    pub retired: bool,
}

impl Slot {
    fn new(id: EvalId, parent: Option<EvalId>) -> Self {
        Self {
            id,
            parent,
            child: None,
            phase: Phase::None,
            event_id: None,
            sequence: 0,
            group: None,
            high_water: 0,
            committed: false,
            retired: false,
        }
    }

    /// Whether this slot commits with another slot's transaction.
    pub fn is_member(&self) -> bool {
        self.group.is_some()
    }

    /// Forget the per-event state so the slot can evaluate the next event of
    /// a batch.
    pub fn clear(&mut self) {
        self.phase = Phase::None;
        self.event_id = None;
        self.sequence = 0;
        self.group = None;
        self.high_water = 0;
        self.committed = false;
        self.retired = false;
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: BTreeMap<EvalId, Slot>,
    next_id: EvalId,
}

impl Registry {
    pub fn insert(&mut self, parent: Option<EvalId>) -> EvalId {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(parent) = parent.and_then(|p| self.slots.get_mut(&p)) {
            parent.child = Some(id);
        }
        self.slots.insert(id, Slot::new(id, parent));
        id
    }

    pub fn remove(&mut self, id: EvalId) -> Option<Slot> {
        let slot = self.slots.remove(&id)?;
        if let Some(parent) = slot.parent.and_then(|p| self.slots.get_mut(&p)) {
            if parent.child == Some(id) {
                parent.child = None;
            }
        }
        Some(slot)
    }

    pub fn get(&self, id: EvalId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: EvalId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Highest sequence held by a live evaluation.
    pub fn seqmax(&self) -> u64 {
        self.iter().map(|s| s.sequence).max().unwrap_or(0)
    }

    /// Lowest live sequence above `sequence`.
    pub fn seqnext(&self, sequence: u64) -> Option<u64> {
        self.iter().map(|s| s.sequence).filter(|&s| s > sequence).min()
    }

    pub fn sequnique(&self, sequence: u64) -> bool {
        self.iter().filter(|s| s.sequence == sequence).count() == 1
    }

    /// First live evaluation holding `event_id`.
    pub fn find_event(&self, event_id: &EventId) -> Option<&Slot> {
        self.iter().find(|s| s.event_id.as_ref() == Some(event_id))
    }

    /// Live evaluations of `event_id` other than `except`.
    pub fn count_event(&self, event_id: &EventId, except: EvalId) -> usize {
        self.iter()
            .filter(|s| s.id != except && s.event_id.as_ref() == Some(event_id))
            .count()
    }

    /// Whether a commit unit ordered before `sequence` has yet to commit.
    pub fn pending_commit_below(&self, sequence: u64) -> bool {
        self.iter()
            .any(|s| s.sequence > 0 && s.sequence < sequence && !s.committed && !s.is_member())
    }

    /// Whether a commit unit ordered before `sequence` has yet to retire.
    pub fn pending_retire_below(&self, sequence: u64) -> bool {
        self.iter()
            .any(|s| s.sequence > 0 && s.sequence < sequence && !s.retired && !s.is_member())
    }

    /// Lowest unretired sequence of any commit unit other than `except`.
    pub fn lowest_unretired_except(&self, except: EvalId) -> Option<u64> {
        self.iter()
            .filter(|s| s.id != except && s.sequence > 0 && !s.retired && !s.is_member())
            .map(|s| s.sequence)
            .min()
    }

    /// Depth of `id` in its evaluation tree; roots are zero.
    pub fn depth_of(&self, id: EvalId) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|s| s.parent);
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.get(parent).and_then(|s| s.parent);
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_links() {
        let mut reg = Registry::default();
        let root = reg.insert(None);
        let child = reg.insert(Some(root));
        assert_eq!(reg.get(root).unwrap().child, Some(child));
        assert_eq!(reg.depth_of(child), 1);
        reg.remove(child);
        assert_eq!(reg.get(root).unwrap().child, None);
    }

    #[test]
    fn test_members_do_not_block_others() {
        let mut reg = Registry::default();
        let root = reg.insert(None);
        let member = reg.insert(Some(root));
        let other = reg.insert(None);
        reg.get_mut(root).unwrap().sequence = 5;
        let m = reg.get_mut(member).unwrap();
        m.sequence = 7;
        m.group = Some(root);
        reg.get_mut(other).unwrap().sequence = 8;

        assert!(reg.pending_commit_below(8));
        reg.get_mut(root).unwrap().committed = true;
        assert!(!reg.pending_commit_below(8));
        assert_eq!(reg.lowest_unretired_except(other), Some(5));
        assert_eq!(reg.seqnext(5), Some(7));
        assert_eq!(reg.seqnext(8), None);
    }

    #[test]
    fn test_find_event_skips_idle_slots() {
        let mut reg = Registry::default();
        let idle = reg.insert(None);
        let busy = reg.insert(None);
        let event_id = EventId::parse("$x:b.test").unwrap();
        reg.get_mut(busy).unwrap().event_id = Some(event_id.clone());

        assert_eq!(reg.find_event(&event_id).map(|s| s.id), Some(busy));
        assert_eq!(reg.count_event(&event_id, idle), 1);
        assert_eq!(reg.count_event(&event_id, busy), 0);
    }
}
