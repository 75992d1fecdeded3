use std::collections::VecDeque;
use std::time::SystemTime;

use super::node::NodeId;

/// One k-bucket. Both lists keep the most recently seen id at the front.
/// Addresses and liveness state live in the routing table's peer map; the
/// bucket only orders ids.
#[derive(Debug, Clone)]
pub struct Bucket {
    k: usize,
    active: VecDeque<NodeId>,
    candidates: VecDeque<NodeId>,
    last_updated: SystemTime,
}

impl Bucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            active: VecDeque::with_capacity(k),
            candidates: VecDeque::with_capacity(k),
            last_updated: SystemTime::now(),
        }
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.active.contains(id)
    }

    pub fn is_candidate(&self, id: &NodeId) -> bool {
        self.candidates.contains(id)
    }

    pub fn is_full(&self) -> bool {
        self.active.len() >= self.k
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.candidates.is_empty()
    }

    /// Moves an active id to the front. Returns false if it is not active.
    pub fn refresh(&mut self, id: &NodeId) -> bool {
        let Some(pos) = self.active.iter().position(|n| n == id) else {
            return false;
        };
        if let Some(existing) = self.active.remove(pos) {
            self.active.push_front(existing);
        }
        self.touch();
        true
    }

    /// Inserts at the front of the active list. The caller checks capacity.
    pub fn insert_active(&mut self, id: NodeId) {
        debug_assert!(!self.is_full());
        self.remove_candidate(&id);
        self.active.push_front(id);
        self.touch();
    }

    /// Pushes onto the front of the candidate list and returns the oldest
    /// candidate if that overflowed the list.
    pub fn push_candidate(&mut self, id: NodeId) -> Option<NodeId> {
        self.remove_candidate(&id);
        self.candidates.push_front(id);
        if self.candidates.len() > self.k {
            self.candidates.pop_back()
        } else {
            None
        }
    }

    pub fn remove_active(&mut self, id: &NodeId) -> bool {
        match self.active.iter().position(|n| n == id) {
            Some(pos) => {
                self.active.remove(pos);
                true
            }
            None => false,
        }
    }

    fn remove_candidate(&mut self, id: &NodeId) {
        self.candidates.retain(|n| n != id);
    }

    /// Moves the most recently seen candidate into the active list.
    pub fn promote_candidate(&mut self) -> Option<NodeId> {
        if self.is_full() {
            return None;
        }
        let promoted = self.candidates.pop_front()?;
        self.active.push_front(promoted);
        self.touch();
        Some(promoted)
    }

    pub fn active(&self) -> impl Iterator<Item = &NodeId> {
        self.active.iter()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &NodeId> {
        self.candidates.iter()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn candidate_len(&self) -> usize {
        self.candidates.len()
    }

    pub fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    fn touch(&mut self) {
        self.last_updated = SystemTime::now();
    }
}
