// Stages - named processing steps driven by the workflow engine

//! # Stages
//!
//! A [`Stage`] receives a read-only [`RunView`] and a [`StepContext`]; it
//! never touches the run state directly. Anything with side effects goes
//! through a checkpointed step, which makes re-running a stage with the same
//! run state safe.
//!
//! - [`ExtractionStage`]: fetch, understand, validate
//! - [`PersistenceStage`]: flatten, decide the status, write the record once

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::tools::{FetchAndExtractText, FetchedDocument, PersistRequest, PersistResult, StepContext};
use crate::llm::TextUnderstanding;
use crate::models::{
    flatten, ContentEntry, DocumentMetadata, DocumentStatus, ExtractionResult, RunView, StageId,
};
use crate::{PipelineError, Result};

/// A named processing step
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Wall-clock budget of a single attempt
    fn timeout(&self) -> Duration;

    async fn run(&self, run: RunView<'_>, ctx: &mut StepContext<'_>) -> Result<Value>;
}

/// Where the extracted document came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub document_id: String,
    pub file_name: String,
    pub file_url: String,
    pub size_mb: String,
    pub pages: u64,
}

/// Output of [`ExtractionStage`], stored in the run results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub result: ExtractionResult,
    pub source: SourceMetadata,
}

pub struct ExtractionStage {
    fetch: FetchAndExtractText,
    understanding: Arc<dyn TextUnderstanding>,
    timeout: Duration,
}

impl ExtractionStage {
    pub const UNDERSTAND_STEP: &'static str = "understand";

    pub fn new(
        fetch: FetchAndExtractText,
        understanding: Arc<dyn TextUnderstanding>,
        timeout: Duration,
    ) -> Self {
        Self {
            fetch,
            understanding,
            timeout,
        }
    }
}

#[async_trait]
impl Stage for ExtractionStage {
    fn id(&self) -> StageId {
        StageId::Extract
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, run: RunView<'_>, ctx: &mut StepContext<'_>) -> Result<Value> {
        let payload = run.payload;

        let fetched: FetchedDocument = serde_json::from_value(
            ctx.invoke_tool(&self.fetch, FetchAndExtractText::input(&payload.file_url))
                .await?,
        )?;
        if fetched.raw_text.trim().is_empty() {
            return Err(PipelineError::Parse(format!(
                "{} has no extractable text",
                payload.file_name
            )));
        }

        let understanding = Arc::clone(&self.understanding);
        let raw_text = fetched.raw_text.clone();
        let reply: String = ctx
            .run_step(Self::UNDERSTAND_STEP, || async move {
                understanding.understand(&raw_text).await
            })
            .await?;

        let result = ExtractionResult::from_response(&reply)?;
        info!(
            "Document {} classified as {} ({:.2}), review required: {}",
            payload.document_id,
            result.document_type(),
            result.classification_confidence,
            result.requires_review()
        );

        let output = ExtractionOutput {
            result,
            source: SourceMetadata {
                document_id: payload.document_id.clone(),
                file_name: payload.file_name.clone(),
                file_url: payload.file_url.clone(),
                size_mb: fetched.size_mb,
                pages: fetched.pages,
            },
        };
        Ok(serde_json::to_value(output)?)
    }
}

pub struct PersistenceStage {
    persist: PersistResult,
    timeout: Duration,
}

impl PersistenceStage {
    pub const RECORD_FAILURE_STEP: &'static str = "record-failure";

    pub fn new(persist: PersistResult, timeout: Duration) -> Self {
        Self { persist, timeout }
    }

    /// Build the record update for a validated extraction
    pub fn request_for(output: &ExtractionOutput) -> Result<PersistRequest> {
        let result = &output.result;
        let mut content = flatten(&result.fields)?;
        if content.is_empty() {
            // Nothing was found; keep the classification so the record is not blank
            content.push(ContentEntry::new("document_type", result.document_type().as_str()));
        }

        let status = if result.requires_review() {
            DocumentStatus::RequiresReview
        } else {
            DocumentStatus::Completed
        };

        Ok(PersistRequest {
            document_id: output.source.document_id.clone(),
            document_type: Some(result.document_type()),
            content,
            metadata: DocumentMetadata {
                summary: Some(result.summary.clone()),
                notes: result.review_notes().unwrap_or_default(),
                keywords: Some(result.keywords.clone()),
                size_mb: Some(output.source.size_mb.clone()),
                pages: Some(output.source.pages.to_string()),
                file_name: Some(output.source.file_name.clone()),
                file_url: Some(output.source.file_url.clone()),
            },
            status,
        })
    }

    /// Minimal update for a run that produced no usable extraction
    pub fn failure_request(run: RunView<'_>, summary: &str) -> PersistRequest {
        PersistRequest {
            document_id: run.payload.document_id.clone(),
            document_type: None,
            content: vec![ContentEntry::new("error", summary)],
            metadata: DocumentMetadata {
                notes: summary.to_string(),
                file_name: Some(run.payload.file_name.clone()),
                file_url: Some(run.payload.file_url.clone()),
                ..Default::default()
            },
            status: DocumentStatus::Failed,
        }
    }

    /// Best-effort fallback write used by the engine when a run fails
    pub async fn record_failure(
        &self,
        run: RunView<'_>,
        ctx: &mut StepContext<'_>,
        summary: &str,
    ) -> Result<Value> {
        let request = Self::failure_request(run, summary);
        ctx.invoke_tool_as(
            Self::RECORD_FAILURE_STEP,
            &self.persist,
            serde_json::to_value(request)?,
        )
        .await
    }
}

#[async_trait]
impl Stage for PersistenceStage {
    fn id(&self) -> StageId {
        StageId::Persist
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, run: RunView<'_>, ctx: &mut StepContext<'_>) -> Result<Value> {
        let request = match run.latest_success(StageId::Extract) {
            Some(value) => {
                let output: ExtractionOutput = serde_json::from_value(value.clone())?;
                Self::request_for(&output)?
            }
            None => {
                let summary = run
                    .last_error()
                    .map(|error| error.message.clone())
                    .unwrap_or_else(|| "extraction produced no result".to_string());
                warn!(
                    "No extraction result for document {}, recording failure",
                    run.payload.document_id
                );
                Self::failure_request(run, &summary)
            }
        };

        ctx.invoke_tool(&self.persist, serde_json::to_value(request)?)
            .await
    }
}
