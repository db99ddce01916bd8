//! Operation pipeline: stamp → conflict check → mutate → commit.
//!
//! Owned by exactly one room task; nothing here is shared or locked.
//! Every accepted operation advances the version by exactly one. Conflicts
//! and tree errors leave the snapshot and version untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use mindweave_core::{apply, Document, TreeError, TreeLimits};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::{CausalIndex, VectorClock};
use crate::config::RoomConfig;
use crate::conflict::{ConflictDetector, ConflictReason, ConflictReport, OperationHistory};
use crate::error::SyncError;
use crate::protocol::{Operation, OperationRequest};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Conflict(ConflictReport),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl From<PipelineError> for SyncError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Conflict(report) => SyncError::Conflict(report),
            PipelineError::Tree(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Applied(Arc<Operation>),
    /// The operation id was already applied; nothing changed.
    Duplicate { operation_id: Uuid, version: u64 },
}

/// Bounded set of recently applied operation ids.
#[derive(Debug)]
struct AppliedIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl AppliedIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.order.push_back(id);
        self.ids.insert(id);
    }
}

pub struct OperationPipeline {
    document: Document,
    version: u64,
    history: OperationHistory,
    detector: ConflictDetector,
    causal: Option<CausalIndex>,
    room_clock: VectorClock,
    limits: TreeLimits,
    applied: AppliedIds,
}

impl OperationPipeline {
    pub fn new(document: Document, version: u64, config: &RoomConfig) -> Self {
        Self {
            document,
            version,
            history: OperationHistory::new(config.window_size),
            detector: ConflictDetector::new(config.conflict_threshold_ms, config.conflict_policy),
            causal: config.causal_check.then(CausalIndex::new),
            room_clock: VectorClock::new(),
            limits: TreeLimits {
                max_nodes: config.max_nodes,
            },
            applied: AppliedIds::new(config.dedup_capacity),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Merge of every clock carried by an accepted operation.
    pub fn room_clock(&self) -> &VectorClock {
        &self.room_clock
    }

    pub fn recent_operations(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.history.recent()
    }

    pub fn submit(&mut self, request: OperationRequest, origin: Uuid, now_ms: u64) -> Result<Submission, PipelineError> {
        if let Some(id) = request.operation_id {
            if self.applied.contains(&id) {
                log::debug!("operation {id} already applied, acknowledging as duplicate");
                return Ok(Submission::Duplicate {
                    operation_id: id,
                    version: self.version,
                });
            }
        }

        let candidate = Operation {
            id: request.operation_id.unwrap_or_else(Uuid::new_v4),
            target_node_id: request.mutation.target_node_id().to_string(),
            mutation: request.mutation,
            origin_session_id: origin,
            server_timestamp: now_ms,
            document_version: self.version + 1,
            clock: request.clock,
        };

        self.history.prune(now_ms, self.detector.threshold_ms());
        if let Some(report) = self.detector.check(&candidate, &self.history) {
            log::debug!(
                "rejected {} on {} from {origin}: {}",
                candidate.kind(),
                candidate.target_node_id,
                report.reason
            );
            return Err(PipelineError::Conflict(report));
        }
        if let Some(index) = &self.causal {
            if let Some(prior) = index.find_concurrent(&candidate) {
                log::debug!(
                    "rejected {} on {}: concurrent with operation {}",
                    candidate.kind(),
                    candidate.target_node_id,
                    prior.id
                );
                return Err(PipelineError::Conflict(ConflictReport {
                    reason: ConflictReason::ConcurrentEdit,
                    conflicting: vec![prior],
                }));
            }
        }

        let next = apply(&self.document, &candidate.mutation, &self.limits)?;

        let op = Arc::new(candidate);
        self.document = next;
        self.version = op.document_version;
        self.history.push(op.clone());
        if let Some(index) = &mut self.causal {
            index.record(&op);
        }
        if let Some(clock) = &op.clock {
            self.room_clock.merge(clock);
        }
        self.applied.insert(op.id);
        log::debug!("applied {} on {} at version {}", op.kind(), op.target_node_id, self.version);
        Ok(Submission::Applied(op))
    }
}
