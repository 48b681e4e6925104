// docflow - event-driven document extraction pipeline
// An uploaded document reference goes in, a finalized Document Record comes out

//! # docflow
//!
//! This is the library root for docflow, a durable, LLM-backed pipeline that
//! turns a "document ready" event into a structured, reviewed Document Record.
//!
//! ## Core Components
//!
//! ### Domain Models (`models`)
//! - [`RunState`]: the per-run state the engine mutates after every stage
//! - [`ExtractionResult`]: validated, typed output of the extraction stage
//! - [`DocumentRecord`]: the externally owned record this pipeline finalizes
//! - [`TriggerEvent`]: the inbound `app/pdf` event
//!
//! ### Schema Validator (`schema`)
//! Structural validation of untrusted JSON (tool inputs, tool outputs and the
//! text-understanding service's replies) into typed values.
//!
//! ### Engine (`engine`)
//! - [`Router`]: pure function from run state to the next stage
//! - [`WorkflowEngine`]: checkpointed, retrying execution loop
//! - [`EventTrigger`]: starts exactly one run per inbound event
//! - Tools and stages that do the side-effecting work
//!
//! ### Text Understanding (`llm`)
//! OpenAI-compatible chat-completions client used as a black box that returns
//! JSON text.
//!
//! ### Server (`server`)
//! Thin HTTP surface that accepts events and exposes run state.
//!
//! ## Data Flow
//!
//! ```text
//! TriggerEvent
//!   ↓ EventTrigger::handle
//! WorkflowEngine::start  → RunState { call_count: 0 }
//!   ↓ Router::route
//! ExtractionStage  (fetch → understand → validate)
//!   ↓ Router::route
//! PersistenceStage (flatten → decide status → PersistResult)
//!   ↓ Router::route
//! Finish(Completed | Failed)
//! ```

pub mod config;
pub mod engine;
pub mod llm;
pub mod models;
pub mod schema;
pub mod server;

// Re-export core domain types for easy access
pub use models::{
    ContentEntry, DocumentEvent, DocumentMetadata, DocumentRecord, DocumentStatus, DocumentType,
    ErrorSummary, ExtractedFields, ExtractionResult, RunState, RunStatus, StageInvocation,
    StageOutcome, StageResult, TriggerEvent,
};

// Re-export engine types for convenience
pub use engine::{
    router::{Route, Router, StageId},
    storage::{DocumentStore, InMemoryDocumentStore, JsonFileDocumentStore},
    trigger::EventTrigger,
    workflow::{EngineConfig, RetryPolicy, WorkflowEngine},
};

pub use config::PipelineConfig;
pub use schema::{Schema, ValidationError};

use thiserror::Error;

/// Error taxonomy for pipeline operations
///
/// Every failure the engine can observe lands in exactly one variant, and
/// [`PipelineError::is_retryable`] decides whether the step that produced it
/// gets another attempt.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A value failed the Schema Validator
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The source file could not be fetched (network failure, non-2xx status)
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The source file was fetched but its content could not be read
    #[error("Parse failed: {0}")]
    Parse(String),

    /// The target record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient storage-layer failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The Document Record already holds a different terminal result
    #[error("Document {0} is already finalized")]
    AlreadyFinalized(String),

    /// The record's current state does not allow the requested change
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unexpected failure inside a stage
    #[error("Stage error: {0}")]
    Stage(String),

    /// A stage attempt exceeded its wall-clock budget
    #[error("Stage {stage} timed out after {after_ms}ms")]
    Timeout { stage: String, after_ms: u64 },

    /// The text-understanding service could not be reached or refused the request
    #[error("Text understanding service error: {0}")]
    TextUnderstanding(String),

    /// Attempt to mutate a run that already left the running state
    #[error("Run {0} is no longer running")]
    RunFinalized(uuid::Uuid),

    /// Inbound event was not an `app/pdf` event
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the step that produced this error should be attempted again.
    ///
    /// Transient failures retry; content-level failures (corrupt input,
    /// schema mismatch, missing record) never self-heal and fail at once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Fetch(_)
                | PipelineError::Persistence(_)
                | PipelineError::Stage(_)
                | PipelineError::Timeout { .. }
                | PipelineError::TextUnderstanding(_)
        )
    }

    /// Stable label stored alongside the message in run results
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Fetch(_) => "fetch_error",
            PipelineError::Parse(_) => "parse_error",
            PipelineError::NotFound(_) => "not_found_error",
            PipelineError::Persistence(_) => "persistence_error",
            PipelineError::AlreadyFinalized(_) => "already_finalized",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::Stage(_) => "stage_error",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::TextUnderstanding(_) => "text_understanding_error",
            PipelineError::RunFinalized(_) => "run_finalized",
            PipelineError::InvalidEvent(_) => "invalid_event",
            PipelineError::Serialization(_) => "serialization_error",
            PipelineError::Config(_) => "config_error",
            PipelineError::Io(_) => "io_error",
        }
    }
}

/// Type alias for Results that use the pipeline error type
pub type Result<T> = std::result::Result<T, PipelineError>;
