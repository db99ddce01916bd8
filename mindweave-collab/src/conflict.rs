//! Conflict detection against recently accepted operations.
//!
//! Two operations conflict when they were accepted less than `threshold_ms`
//! apart and either
//! - target the same node, or
//! - one deletes a node the other creates a child under.
//!
//! Detection is reject-only: the candidate is refused and the client decides
//! whether to resubmit. Which prior operations are considered depends on the
//! [`ConflictPolicy`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use mindweave_core::MutationKind;
use serde::{Deserialize, Serialize};

use crate::protocol::Operation;

/// Which prior operations a candidate is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The last `window_size` accepted operations of the room.
    #[default]
    RecentWindow,
    /// The last `window_size` accepted operations touching each node the
    /// candidate touches, regardless of unrelated traffic in between.
    LatestPerNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    SameNode,
    DeleteCreateRace,
    ConcurrentEdit,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SameNode => "node was modified by a recent operation",
            Self::DeleteCreateRace => "node was deleted while a child was being created under it",
            Self::ConcurrentEdit => "operation is causally concurrent with the latest edit of the node",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictReport {
    pub reason: ConflictReason,
    /// Prior operations the candidate conflicts with, oldest first.
    pub conflicting: Vec<Arc<Operation>>,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conflict: {} ({} conflicting operation(s))",
            self.reason,
            self.conflicting.len()
        )
    }
}

/// Bounded record of accepted operations, indexed both by arrival order and
/// by touched node.
#[derive(Debug)]
pub struct OperationHistory {
    window: VecDeque<Arc<Operation>>,
    per_node: HashMap<String, VecDeque<Arc<Operation>>>,
    window_size: usize,
}

impl OperationHistory {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            per_node: HashMap::new(),
            window_size,
        }
    }

    pub fn push(&mut self, op: Arc<Operation>) {
        for node in op.mutation.touched_nodes() {
            let entries = self.per_node.entry(node.to_string()).or_default();
            if entries.len() == self.window_size {
                entries.pop_front();
            }
            entries.push_back(op.clone());
        }
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(op);
    }

    /// Drop per-node entries older than `horizon_ms` before `now_ms`. They can
    /// no longer fall inside any conflict threshold no larger than the horizon.
    pub fn prune(&mut self, now_ms: u64, horizon_ms: u64) {
        let cutoff = now_ms.saturating_sub(horizon_ms);
        self.per_node.retain(|_, entries| {
            while entries.front().is_some_and(|op| op.server_timestamp < cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }

    /// Last N accepted operations, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.window.iter()
    }

    /// Operations recorded against any of `nodes`, without duplicates.
    pub fn touching<'a>(&'a self, nodes: &[&str]) -> Vec<&'a Arc<Operation>> {
        let mut seen = HashSet::new();
        let mut out: Vec<&Arc<Operation>> = nodes
            .iter()
            .filter_map(|n| self.per_node.get(*n))
            .flatten()
            .filter(|op| seen.insert(op.id))
            .collect();
        out.sort_by_key(|op| op.document_version);
        out
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn indexed_nodes(&self) -> usize {
        self.per_node.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    threshold_ms: u64,
    policy: ConflictPolicy,
}

impl ConflictDetector {
    pub fn new(threshold_ms: u64, policy: ConflictPolicy) -> Self {
        Self { threshold_ms, policy }
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// `None` approves the candidate.
    pub fn check(&self, candidate: &Operation, history: &OperationHistory) -> Option<ConflictReport> {
        let priors: Vec<&Arc<Operation>> = match self.policy {
            ConflictPolicy::RecentWindow => history.recent().collect(),
            ConflictPolicy::LatestPerNode => history.touching(&candidate.mutation.touched_nodes()),
        };

        let mut reason = None;
        let mut conflicting = Vec::new();
        for prior in priors {
            if let Some(r) = self.conflicts(candidate, prior) {
                reason.get_or_insert(r);
                conflicting.push(prior.clone());
            }
        }
        reason.map(|reason| ConflictReport { reason, conflicting })
    }

    fn conflicts(&self, candidate: &Operation, prior: &Operation) -> Option<ConflictReason> {
        if candidate.server_timestamp.abs_diff(prior.server_timestamp) >= self.threshold_ms {
            return None;
        }
        if candidate.target_node_id == prior.target_node_id {
            return Some(ConflictReason::SameNode);
        }
        if deletes_parent_of_create(candidate, prior) || deletes_parent_of_create(prior, candidate) {
            return Some(ConflictReason::DeleteCreateRace);
        }
        None
    }
}

fn deletes_parent_of_create(delete: &Operation, create: &Operation) -> bool {
    delete.kind() == MutationKind::Delete && create.mutation.created_under() == Some(delete.target_node_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindweave_core::{Mutation, NodePatch};
    use uuid::Uuid;

    fn op(mutation: Mutation, at_ms: u64, version: u64) -> Arc<Operation> {
        Arc::new(Operation {
            id: Uuid::new_v4(),
            target_node_id: mutation.target_node_id().to_string(),
            mutation,
            origin_session_id: Uuid::new_v4(),
            server_timestamp: at_ms,
            document_version: version,
            clock: None,
        })
    }

    fn update(node: &str, at_ms: u64, version: u64) -> Arc<Operation> {
        op(Mutation::update(node, NodePatch::text("t")), at_ms, version)
    }

    #[test]
    fn test_same_node_inside_threshold() {
        let detector = ConflictDetector::new(1000, ConflictPolicy::RecentWindow);
        let mut history = OperationHistory::new(10);
        let first = update("x", 0, 1);
        history.push(first.clone());

        let report = detector.check(&update("x", 500, 2), &history).unwrap();
        assert_eq!(report.reason, ConflictReason::SameNode);
        assert_eq!(report.conflicting, vec![first]);

        assert!(detector.check(&update("y", 500, 2), &history).is_none());
    }

    #[test]
    fn test_threshold_is_strict() {
        let detector = ConflictDetector::new(1000, ConflictPolicy::RecentWindow);
        let mut history = OperationHistory::new(10);
        history.push(update("x", 0, 1));
        assert!(detector.check(&update("x", 999, 2), &history).is_some());
        assert!(detector.check(&update("x", 1000, 2), &history).is_none());
    }

    #[test]
    fn test_delete_create_race_both_directions() {
        let detector = ConflictDetector::new(1000, ConflictPolicy::RecentWindow);

        let mut history = OperationHistory::new(10);
        history.push(op(Mutation::create("p", "child", "c"), 0, 1));
        let report = detector.check(&op(Mutation::delete("p", false), 100, 2), &history).unwrap();
        assert_eq!(report.reason, ConflictReason::DeleteCreateRace);

        let mut history = OperationHistory::new(10);
        history.push(op(Mutation::delete("p", false), 0, 1));
        let report = detector
            .check(&op(Mutation::create("p", "child", "c"), 100, 2), &history)
            .unwrap();
        assert_eq!(report.reason, ConflictReason::DeleteCreateRace);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut history = OperationHistory::new(3);
        for v in 1..=5 {
            history.push(update(&format!("n{v}"), v * 10, v));
        }
        let versions: Vec<u64> = history.recent().map(|o| o.document_version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    /// An edit of "x" followed by unrelated edits that push it out of a
    /// window of two. The two policies disagree on the next edit of "x".
    #[test]
    fn test_policies_disagree_when_window_overflows() {
        let mut history = OperationHistory::new(2);
        let first = update("x", 0, 1);
        history.push(first.clone());
        history.push(update("y", 100, 2));
        history.push(update("z", 200, 3));
        let candidate = update("x", 300, 4);

        let window = ConflictDetector::new(1000, ConflictPolicy::RecentWindow);
        assert!(window.check(&candidate, &history).is_none());

        let per_node = ConflictDetector::new(1000, ConflictPolicy::LatestPerNode);
        let report = per_node.check(&candidate, &history).unwrap();
        assert_eq!(report.reason, ConflictReason::SameNode);
        assert_eq!(report.conflicting, vec![first]);
    }

    #[test]
    fn test_per_node_indexes_create_parent() {
        let detector = ConflictDetector::new(1000, ConflictPolicy::LatestPerNode);
        let mut history = OperationHistory::new(10);
        history.push(op(Mutation::create("p", "child", "c"), 0, 1));
        let report = detector.check(&op(Mutation::delete("p", true), 50, 2), &history).unwrap();
        assert_eq!(report.reason, ConflictReason::DeleteCreateRace);
    }

    #[test]
    fn test_prune_drops_stale_nodes() {
        let mut history = OperationHistory::new(10);
        history.push(update("old", 0, 1));
        history.push(update("new", 5_000, 2));
        history.prune(5_500, 1_000);
        assert_eq!(history.indexed_nodes(), 1);
        // The arrival-order window is bounded by size, not age.
        assert_eq!(history.len(), 2);
    }
}
