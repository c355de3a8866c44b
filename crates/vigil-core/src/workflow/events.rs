//! Workflow event stream.
//!
//! Events are totally ordered per workflow and idempotent-keyed by
//! `(workflow_id, seq)`. Subscribers attach per workflow; reconnecting
//! subscribers pass their last seen sequence number and receive a replay
//! of everything after it before live events.

use crate::workflow::state::{NodeKind, WorkflowPhase};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the engine over the life of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted,
    NodeStarted { kind: NodeKind, index: usize },
    ToolStarted { tool_id: String },
    FindingEmitted { finding_id: String },
    ToolFinished { tool_id: String, status: String },
    NodeFinished { kind: NodeKind, index: usize, status: String },
    Progress { value: f64 },
    CheckpointSaved { seq: u64 },
    Paused,
    Resumed,
    WorkflowFinished { phase: WorkflowPhase },
    /// Out-of-band observation, e.g. an unmapped severity token.
    Diagnostic { message: String },
}

/// An event with its per-workflow sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub workflow_id: String,
    pub seq: u64,
    pub event: WorkflowEvent,
    pub emitted_at: DateTime<Utc>,
}

struct Channel {
    // Lock covers both counter and log so sequence assignment and append
    // are atomic, keeping the per-workflow total order.
    ordered: Mutex<ChannelLog>,
    tx: broadcast::Sender<SequencedEvent>,
}

struct ChannelLog {
    next_seq: u64,
    log: Vec<SequencedEvent>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            ordered: Mutex::new(ChannelLog {
                next_seq: 1,
                log: Vec::new(),
            }),
            tx,
        }
    }
}

/// Per-workflow event channels with replay.
pub struct EventHub {
    channels: DashMap<String, Channel>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Publish an event, assigning the next sequence number for the
    /// workflow. Returns the assigned number.
    pub fn publish(&self, workflow_id: &str, event: WorkflowEvent) -> u64 {
        let channel = self
            .channels
            .entry(workflow_id.to_string())
            .or_insert_with(|| Channel::new(self.capacity));

        let sequenced = {
            let mut ordered = channel.ordered.lock();
            let seq = ordered.next_seq;
            ordered.next_seq += 1;
            let sequenced = SequencedEvent {
                workflow_id: workflow_id.to_string(),
                seq,
                event,
                emitted_at: Utc::now(),
            };
            ordered.log.push(sequenced.clone());
            sequenced
        };

        let seq = sequenced.seq;
        let _ = channel.tx.send(sequenced);
        seq
    }

    /// Attach to a workflow's stream. `last_seen` requests replay of every
    /// retained event with a greater sequence number before live delivery.
    pub fn subscribe(
        &self,
        workflow_id: &str,
        last_seen: Option<u64>,
    ) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        let channel = self
            .channels
            .entry(workflow_id.to_string())
            .or_insert_with(|| Channel::new(self.capacity));

        let ordered = channel.ordered.lock();
        let floor = last_seen.unwrap_or(0);
        let replay = ordered
            .log
            .iter()
            .filter(|e| e.seq > floor)
            .cloned()
            .collect();
        let rx = channel.tx.subscribe();
        drop(ordered);
        (replay, rx)
    }

    /// Retained events for a workflow, in order.
    pub fn history(&self, workflow_id: &str) -> Vec<SequencedEvent> {
        self.channels
            .get(workflow_id)
            .map(|c| c.ordered.lock().log.clone())
            .unwrap_or_default()
    }

    /// Drop a workflow's channel and retained events.
    pub fn remove(&self, workflow_id: &str) {
        self.channels.remove(workflow_id);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotonic_per_workflow() {
        let hub = EventHub::default();
        let a = hub.publish("wf-1", WorkflowEvent::WorkflowStarted);
        let b = hub.publish("wf-1", WorkflowEvent::Progress { value: 0.5 });
        let c = hub.publish("wf-2", WorkflowEvent::WorkflowStarted);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        // Independent sequence per workflow.
        assert_eq!(c, 1);
    }

    #[test]
    fn replay_from_last_seen() {
        let hub = EventHub::default();
        for value in [0.25, 0.5, 0.75, 1.0] {
            hub.publish("wf-1", WorkflowEvent::Progress { value });
        }

        let (replay, _rx) = hub.subscribe("wf-1", Some(2));
        let seqs: Vec<_> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn live_events_follow_replay() {
        let hub = EventHub::default();
        hub.publish("wf-1", WorkflowEvent::WorkflowStarted);

        let (replay, mut rx) = hub.subscribe("wf-1", None);
        assert_eq!(replay.len(), 1);

        hub.publish("wf-1", WorkflowEvent::Paused);
        let live = rx.recv().await.unwrap();
        assert_eq!(live.seq, 2);
        assert_eq!(live.event, WorkflowEvent::Paused);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = WorkflowEvent::NodeFinished {
            kind: NodeKind::SingleScan,
            index: 1,
            status: "SUCCEEDED".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_finished");
        assert_eq!(json["kind"], "single_scan");
    }
}
