// docflow Engine
// Execution layer between the domain models and the outside world

//! # Engine Module
//!
//! Everything that runs: the router that picks the next stage, the stages and
//! tools that do side-effecting work, the workflow engine that sequences them
//! with retries and checkpoints, and the trigger that starts runs.
//!
//! ## Engine Components
//!
//! ### Router (`router` module)
//! - Pure function from run state to the next stage or a terminal status
//!
//! ### Stages and Tools (`stages`, `tools` modules)
//! - `ExtractionStage`: fetch, understand, validate
//! - `PersistenceStage`: flatten, decide review status, write once
//! - `FetchAndExtractText` and `PersistResult`: schema-checked side effects
//!
//! ### Workflow Engine (`workflow` module)
//! - Bounded retries with exponential backoff, per-attempt timeouts
//! - Run state saved after every attempt; pending runs resume on restart
//!
//! ### Storage (`storage`, `run_store` modules)
//! - `DocumentStore`: the Document Record collaborator
//! - `RunStore`: in-memory or JSON-file persistence of run state
//!
//! ### Event System (`events` module)
//! - Broadcast of run lifecycle events
//!
//! ### Trigger (`trigger` module)
//! - One run per inbound `app/pdf` event, deduplicated by event id

/// Run lifecycle events
pub mod events;

/// Stage selection
pub mod router;

/// Run state persistence
pub mod run_store;

/// Extraction and persistence stages
pub mod stages;

/// Document Record store
pub mod storage;

/// Checkpointed tools and their step context
pub mod tools;

/// Event-to-run entry point
pub mod trigger;

/// Retrying, checkpointed execution loop
pub mod workflow;

pub use events::{EventBus, RunEvent, RunEventKind};
pub use router::{Route, Router};
pub use run_store::{InMemoryRunStore, JsonFileRunStore, RunStore};
pub use stages::{ExtractionOutput, ExtractionStage, PersistenceStage, SourceMetadata, Stage};
pub use storage::{DocumentStore, InMemoryDocumentStore, JsonFileDocumentStore};
pub use tools::{
    FetchAndExtractText, FileFetcher, HttpFileFetcher, PdfTextExtractor, PersistResult,
    StepContext, TextExtractor, Tool,
};
pub use trigger::EventTrigger;
pub use workflow::{EngineConfig, RetryPolicy, WorkflowEngine, WorkflowEngineBuilder};
