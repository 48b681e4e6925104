// Run domain models - pipeline execution state

//! # Run Models
//!
//! - `RunState`: the state of one pipeline execution, mutated only by the engine
//! - `StageResult`: one completed stage execution (success or exhausted failure)
//! - `StageInvocation`: one attempt of one stage, kept for observability
//! - `RunView`: the read-only slice of a run that stages are allowed to see
//!
//! Once a run leaves [`RunStatus::Running`] it is frozen: every mutator
//! returns [`PipelineError::RunFinalized`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::event::DocumentEvent;
use crate::{PipelineError, Result};

/// Named processing stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Extract,
    Persist,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Extract => "extract",
            StageId::Persist => "persist",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable snapshot of a [`PipelineError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&PipelineError> for ErrorSummary {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl std::fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum StageOutcome {
    Success(Value),
    Failure(ErrorSummary),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success(_))
    }
}

/// One entry of the append-only result log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub outcome: StageOutcome,
    pub timestamp: DateTime<Utc>,
}

/// One attempt of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInvocation {
    pub stage: StageId,
    /// 1-based
    pub attempt: u32,
    pub input: Value,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Read-only view of a run handed to stages and the router
#[derive(Debug, Clone, Copy)]
pub struct RunView<'a> {
    pub run_id: Uuid,
    pub payload: &'a DocumentEvent,
    pub results: &'a [StageResult],
    pub call_count: u32,
}

impl<'a> RunView<'a> {
    /// Output of the most recent successful execution of `stage`
    pub fn latest_success(&self, stage: StageId) -> Option<&'a Value> {
        self.results
            .iter()
            .rev()
            .filter(|result| result.stage == stage)
            .find_map(|result| match &result.outcome {
                StageOutcome::Success(value) => Some(value),
                StageOutcome::Failure(_) => None,
            })
    }

    pub fn last_result(&self) -> Option<&'a StageResult> {
        self.results.last()
    }

    /// Most recent failure anywhere in the run
    pub fn last_error(&self) -> Option<&'a ErrorSummary> {
        self.results.iter().rev().find_map(|result| match &result.outcome {
            StageOutcome::Failure(summary) => Some(summary),
            StageOutcome::Success(_) => None,
        })
    }

    /// Snapshot stored as the `input` of a [`StageInvocation`]
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "run_id": self.run_id,
            "call_count": self.call_count,
            "document_id": self.payload.document_id,
            "file_url": self.payload.file_url,
            "prior_results": self.results.len(),
        })
    }
}

/// Complete state of one pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    /// Delivery id of the triggering event, when the source provided one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub payload: DocumentEvent,
    pub call_count: u32,
    pub results: Vec<StageResult>,
    pub invocations: Vec<StageInvocation>,
    /// Memoised step outputs keyed `"<stage>:<step>"`
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Value>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(payload: DocumentEvent, event_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            event_id,
            payload,
            call_count: 0,
            results: Vec::new(),
            invocations: Vec::new(),
            checkpoints: BTreeMap::new(),
            status: RunStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PipelineError::RunFinalized(self.run_id))
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn view(&self) -> RunView<'_> {
        RunView {
            run_id: self.run_id,
            payload: &self.payload,
            results: &self.results,
            call_count: self.call_count,
        }
    }

    pub fn record_invocation(&mut self, invocation: StageInvocation) -> Result<()> {
        self.ensure_running()?;
        self.invocations.push(invocation);
        self.touch();
        Ok(())
    }

    /// Append a completed stage execution and advance the call count
    pub fn record_result(&mut self, stage: StageId, outcome: StageOutcome) -> Result<()> {
        self.ensure_running()?;
        self.results.push(StageResult {
            stage,
            outcome,
            timestamp: Utc::now(),
        });
        self.call_count += 1;
        self.touch();
        Ok(())
    }

    /// Store a checkpoint while the run is still open
    pub fn record_checkpoint(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.ensure_running()?;
        self.checkpoints.insert(key.into(), value);
        self.touch();
        Ok(())
    }

    /// Leave the running state for good
    pub fn finish(&mut self, status: RunStatus, error: Option<ErrorSummary>) -> Result<()> {
        self.ensure_running()?;
        self.status = status;
        self.error = error;
        self.touch();
        Ok(())
    }

    /// Attempts made for `stage` so far
    pub fn attempts_for(&self, stage: StageId) -> usize {
        self.invocations
            .iter()
            .filter(|invocation| invocation.stage == stage)
            .count()
    }
}
