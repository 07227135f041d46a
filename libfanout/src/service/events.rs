//! Structured transition events
//!
//! An in-process broadcast bus carrying one serializable event per state
//! transition: post authored, job claimed, publish attempted, outcome
//! applied. The core emits and moves on; observability collaborators
//! subscribe if they care. With no subscribers, emission is a dropped send,
//! never a block, so the orchestrator has no dependency on any logging
//! backend.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Event bus for distributing transition events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit to all subscribers. Lagging subscribers drop oldest events;
    /// emitters never wait.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One event per observable state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PostCreated {
        post_id: String,
        workspace_id: String,
    },
    PostScheduled {
        post_id: String,
        job_id: String,
        next_run_at: i64,
    },
    PostUnscheduled {
        post_id: String,
        job_id: String,
    },
    JobClaimed {
        job_id: String,
        post_id: String,
    },
    PublishAttempted {
        post_id: String,
        platform: String,
    },
    PublishSucceeded {
        post_id: String,
        external_id: String,
    },
    PublishFailed {
        post_id: String,
        reason: String,
        terminal: bool,
    },
    JobRearmed {
        job_id: String,
        next_run_at: i64,
        attempt_count: i64,
    },
    JobCompleted {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
}
