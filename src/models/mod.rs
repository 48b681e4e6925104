// Core domain models for docflow
// Plain data: no I/O lives here

//! # Domain Models
//!
//! - [`event`]: the inbound `app/pdf` trigger event
//! - [`document`]: the Document Record and its lifecycle statuses
//! - [`extraction`]: typed, validated extraction results and the review policy
//! - [`flatten`]: conversion between typed fields and flat key/value content
//! - [`run`]: per-run execution state

pub mod document;
pub mod event;
pub mod extraction;
pub mod flatten;
pub mod run;

pub use document::{
    ContentEntry, DocumentMetadata, DocumentRecord, DocumentStatus, DocumentType, DocumentUpdate,
};
pub use event::{DocumentEvent, TriggerEvent, PDF_EVENT_NAME};
pub use extraction::{ExtractedFields, ExtractionResult, REVIEW_THRESHOLD};
pub use flatten::{flatten, unflatten};
pub use run::{
    ErrorSummary, RunState, RunStatus, RunView, StageId, StageInvocation, StageOutcome,
    StageResult,
};
