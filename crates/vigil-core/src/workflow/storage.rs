//! Checkpoint and metadata persistence.
//!
//! The engine consumes this narrow interface; the platform treats the
//! backing store as an external service. Writes are idempotent, keyed by
//! `(workflow_id, checkpoint_seq)`. An in-memory implementation is
//! provided for embedding and tests.

use crate::error::StoreError;
use crate::workflow::state::{WorkflowPhase, WorkflowState, WorkflowType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable snapshot of a workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: String,
    pub seq: u64,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            seq: state.checkpoint_seq,
            state: state.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Durable metadata kept alongside checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub phase: WorkflowPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    pub fn of(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            workflow_type: state.workflow_type,
            phase: state.phase,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Persistence interface consumed by the engine.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a checkpoint. Re-writing an existing `(workflow_id, seq)`
    /// is a no-op overwrite.
    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Fetch a checkpoint; the latest when `seq` is omitted.
    async fn get_checkpoint(
        &self,
        workflow_id: &str,
        seq: Option<u64>,
    ) -> Result<Checkpoint, StoreError>;

    /// Sequence numbers of retained checkpoints, ascending.
    async fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<u64>, StoreError>;

    async fn put_workflow_metadata(&self, metadata: WorkflowMetadata) -> Result<(), StoreError>;

    async fn get_workflow_metadata(&self, workflow_id: &str)
        -> Result<WorkflowMetadata, StoreError>;

    /// Remove a workflow's metadata and all its checkpoints.
    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), StoreError>;
}

/// In-memory store with bounded per-workflow checkpoint retention.
pub struct MemoryStore {
    checkpoints: DashMap<String, BTreeMap<u64, Checkpoint>>,
    metadata: DashMap<String, WorkflowMetadata>,
    retention_count: usize,
}

impl MemoryStore {
    pub fn new(retention_count: usize) -> Self {
        Self {
            checkpoints: DashMap::new(),
            metadata: DashMap::new(),
            retention_count: retention_count.max(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let mut entry = self
            .checkpoints
            .entry(checkpoint.workflow_id.clone())
            .or_default();
        entry.insert(checkpoint.seq, checkpoint);
        while entry.len() > self.retention_count {
            let oldest = *entry.keys().next().expect("non-empty map");
            entry.remove(&oldest);
        }
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        workflow_id: &str,
        seq: Option<u64>,
    ) -> Result<Checkpoint, StoreError> {
        let entry = self
            .checkpoints
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        let found = match seq {
            Some(seq) => entry.get(&seq).cloned(),
            None => entry.values().next_back().cloned(),
        };
        found.ok_or_else(|| StoreError::CheckpointNotFound {
            workflow_id: workflow_id.to_string(),
            seq: seq.unwrap_or(0),
        })
    }

    async fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .checkpoints
            .get(workflow_id)
            .map(|entry| entry.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn put_workflow_metadata(&self, metadata: WorkflowMetadata) -> Result<(), StoreError> {
        self.metadata
            .insert(metadata.workflow_id.clone(), metadata);
        Ok(())
    }

    async fn get_workflow_metadata(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowMetadata, StoreError> {
        self.metadata
            .get(workflow_id)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.checkpoints.remove(workflow_id);
        self.metadata.remove(workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::request::ScanTarget;
    use crate::workflow::state::{NodeKind, NodeSpec};

    fn state(seq: u64) -> WorkflowState {
        let mut s = WorkflowState::new(
            "wf-1",
            WorkflowType::CodeCommit,
            ScanTarget::local_path("/tmp/p"),
            vec![NodeSpec::new(NodeKind::Initialize)],
        );
        s.checkpoint_seq = seq;
        s
    }

    #[tokio::test]
    async fn put_get_latest_and_specific() {
        let store = MemoryStore::default();
        store.put_checkpoint(Checkpoint::of(&state(1))).await.unwrap();
        store.put_checkpoint(Checkpoint::of(&state(2))).await.unwrap();

        let latest = store.get_checkpoint("wf-1", None).await.unwrap();
        assert_eq!(latest.seq, 2);
        let first = store.get_checkpoint("wf-1", Some(1)).await.unwrap();
        assert_eq!(first.seq, 1);
    }

    #[tokio::test]
    async fn puts_are_idempotent() {
        let store = MemoryStore::default();
        let checkpoint = Checkpoint::of(&state(1));
        store.put_checkpoint(checkpoint.clone()).await.unwrap();
        store.put_checkpoint(checkpoint).await.unwrap();
        assert_eq!(store.list_checkpoints("wf-1").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn retention_prunes_oldest() {
        let store = MemoryStore::new(2);
        for seq in 1..=4 {
            store.put_checkpoint(Checkpoint::of(&state(seq))).await.unwrap();
        }
        assert_eq!(store.list_checkpoints("wf-1").await.unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let store = MemoryStore::default();
        store.put_checkpoint(Checkpoint::of(&state(1))).await.unwrap();
        store
            .put_workflow_metadata(WorkflowMetadata::of(&state(1)))
            .await
            .unwrap();

        store.delete_workflow("wf-1").await.unwrap();
        assert!(store.get_checkpoint("wf-1", None).await.is_err());
        assert!(store.get_workflow_metadata("wf-1").await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_restores_identical_state() {
        let store = MemoryStore::default();
        let original = state(5);
        store
            .put_checkpoint(Checkpoint::of(&original))
            .await
            .unwrap();
        let restored = store.get_checkpoint("wf-1", Some(5)).await.unwrap();
        assert_eq!(restored.state, original);
    }
}
