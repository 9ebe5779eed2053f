use crate::registry::ConnId;
use std::collections::{HashSet, VecDeque};

/// FIFO of connections waiting for a peer. Each connection appears at most once.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    order: VecDeque<ConnId>,
    members: HashSet<ConnId>,
}

impl WaitingQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Returns `false` if the connection was already queued.
    pub fn push(&mut self, id: ConnId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        true
    }

    /// Remove a connection wherever it sits. Returns `false` if it was not queued.
    pub fn remove(&mut self, id: ConnId) -> bool {
        if !self.members.remove(&id) {
            return false;
        }
        self.order.retain(|queued| *queued != id);
        true
    }

    /// Keep only the connections for which `keep` returns `true`; returns the dropped ones.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<ConnId>
    where
        F: FnMut(ConnId) -> bool,
    {
        let mut dropped = Vec::new();
        self.order.retain(|id| {
            let kept = keep(*id);
            if !kept {
                dropped.push(*id);
            }
            kept
        });
        for id in &dropped {
            self.members.remove(id);
        }
        dropped
    }

    /// Oldest-first search for two queued connections that may be matched.
    ///
    /// Returns the oldest connection that has any compatible partner, together
    /// with the oldest such partner behind it.
    pub fn find_pair<F>(&self, mut compatible: F) -> Option<(ConnId, ConnId)>
    where
        F: FnMut(ConnId, ConnId) -> bool,
    {
        for (i, &a) in self.order.iter().enumerate() {
            for &b in self.order.iter().skip(i + 1) {
                if compatible(a, b) {
                    return Some((a, b));
                }
            }
        }
        None
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnId) -> bool {
        self.members.contains(&id)
    }

    /// Number of waiting connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.order.iter().copied()
    }
}
