//! Vector clocks for causal ordering across reconnects.
//!
//! Each participant increments its own entry for every operation it
//! originates and merges (pointwise max) every clock it observes. Two
//! operations whose clocks are incomparable were made without knowledge of
//! each other, which is exactly what the live conflict window cannot see
//! when one of them was produced offline and replayed later.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use mindweave_core::MutationKind;
use serde::{Deserialize, Serialize};

use crate::protocol::Operation;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// participantId → counter. Entries never decrease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, participant: &str) -> u64 {
        self.0.get(participant).copied().unwrap_or(0)
    }

    /// Increment `participant`'s entry and return the new value.
    pub fn tick(&mut self, participant: &str) -> u64 {
        let counter = self.0.entry(participant.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (participant, &counter) in &other.0 {
            let entry = self.0.entry(participant.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for key in self.0.keys().chain(other.0.keys()) {
            match self.get(key).cmp(&other.get(key)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }
        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

/// Client-side clock owned by one participant.
#[derive(Debug, Clone)]
pub struct ClockCoordinator {
    participant_id: String,
    clock: VectorClock,
}

impl ClockCoordinator {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            clock: VectorClock::new(),
        }
    }

    /// Tick for a locally originated operation and return its marker.
    pub fn stamp(&mut self) -> VectorClock {
        self.clock.tick(&self.participant_id);
        self.clock.clone()
    }

    /// Merge a clock received from the server (remote operation or the
    /// room clock in `initial_data`).
    pub fn observe(&mut self, remote: &VectorClock) {
        self.clock.merge(remote);
    }

    pub fn current(&self) -> &VectorClock {
        &self.clock
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

/// Server-side index of the latest clocked operations, used to catch the
/// same conflicts as the live window when one side was made offline: an
/// edit of the same node, or a delete racing a create under that node.
#[derive(Debug, Default)]
pub struct CausalIndex {
    /// Latest clocked operation targeting each node.
    by_target: HashMap<String, Arc<Operation>>,
    /// Latest clocked create under each parent.
    creates_under: HashMap<String, Arc<Operation>>,
}

impl CausalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorded operation the candidate conflicts with and whose clock is
    /// concurrent with the candidate's. Unclocked candidates never match.
    pub fn find_concurrent(&self, candidate: &Operation) -> Option<Arc<Operation>> {
        let clock = candidate.clock.as_ref()?;
        let same_node = self.by_target.get(&candidate.target_node_id);
        let race = match candidate.mutation.created_under() {
            Some(parent) => self
                .by_target
                .get(parent)
                .filter(|prior| prior.kind() == MutationKind::Delete),
            None if candidate.kind() == MutationKind::Delete => self.creates_under.get(&candidate.target_node_id),
            None => None,
        };
        [same_node, race]
            .into_iter()
            .flatten()
            .find(|prior| prior.clock.as_ref().is_some_and(|c| clock.is_concurrent(c)))
            .cloned()
    }

    /// Record an accepted operation. Operations without a clock are ignored.
    pub fn record(&mut self, op: &Arc<Operation>) {
        if op.clock.is_none() {
            return;
        }
        if op.kind() == MutationKind::Delete {
            self.creates_under.remove(&op.target_node_id);
        }
        if let Some(parent) = op.mutation.created_under() {
            self.creates_under.insert(parent.to_string(), op.clone());
        }
        self.by_target.insert(op.target_node_id.clone(), op.clone());
    }

    /// Number of nodes with a recorded edit.
    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }
}
