// Run event bus

//! # Event System
//!
//! Broadcasts run lifecycle events to any number of subscribers (the HTTP
//! layer, the admin CLI, tests). Publishing never blocks and never fails:
//! with no subscribers the event is simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ErrorSummary, RunStatus, StageId};

/// Something that happened to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted { document_id: String },
    StageStarted { stage: StageId, attempt: u32 },
    StageRetrying { stage: StageId, attempt: u32, delay_ms: u64, error: ErrorSummary },
    StageCompleted { stage: StageId, success: bool },
    RunFinished { status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub kind: RunEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Event bus for publishing and subscribing to run events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000); // Buffer up to 1000 events
        Self { sender }
    }

    pub fn publish(&self, run_id: Uuid, kind: RunEventKind) {
        let _ = self.sender.send(RunEvent {
            run_id,
            kind,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
