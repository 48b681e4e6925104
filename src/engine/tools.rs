// Tools - schema-validated units of side-effecting work

//! # Tools
//!
//! A [`Tool`] declares an input schema, an optional output schema and an
//! async handler. Stages never call a handler directly; they go through
//! [`StepContext::invoke_tool`], which:
//!
//! 1. returns the stored output if this step already succeeded in the run
//! 2. validates the input
//! 3. runs the handler
//! 4. validates the output
//! 5. records the output as a checkpoint
//!
//! A failing handler records nothing, so the next attempt runs it again.
//!
//! ## Concrete Tools
//! - [`FetchAndExtractText`]: download a file and extract its text
//! - [`PersistResult`]: the single terminal write of a Document Record

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::storage::DocumentStore;
use crate::models::{
    ContentEntry, DocumentMetadata, DocumentStatus, DocumentType, DocumentUpdate, StageId,
};
use crate::schema::{self, Field, Schema, ValidationError, ValidationErrorKind};
use crate::{PipelineError, Result};

/// A named, schema-validated, side-effecting operation
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn input_schema(&self) -> Schema;

    /// Shape the handler promises to return, checked after every call
    fn output_schema(&self) -> Option<Schema> {
        None
    }

    async fn handle(&self, input: Value) -> Result<Value>;
}

/// Checkpointed step execution for one stage attempt
///
/// Borrows the run's checkpoint map for the duration of the attempt. Keys are
/// `"<stage>:<step>"`.
pub struct StepContext<'a> {
    stage: StageId,
    checkpoints: &'a mut BTreeMap<String, Value>,
}

impl<'a> StepContext<'a> {
    pub fn new(stage: StageId, checkpoints: &'a mut BTreeMap<String, Value>) -> Self {
        Self { stage, checkpoints }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn checkpoint_key(&self, step: &str) -> String {
        format!("{}:{}", self.stage, step)
    }

    pub fn checkpoint(&self, step: &str) -> Option<&Value> {
        self.checkpoints.get(&self.checkpoint_key(step))
    }

    /// Invoke `tool` as a checkpointed step named after the tool
    pub async fn invoke_tool(&mut self, tool: &dyn Tool, input: Value) -> Result<Value> {
        self.invoke_tool_as(tool.name(), tool, input).await
    }

    /// Invoke `tool` under an explicit step name
    pub async fn invoke_tool_as(&mut self, step: &str, tool: &dyn Tool, input: Value) -> Result<Value> {
        let key = self.checkpoint_key(step);
        if let Some(output) = self.checkpoints.get(&key) {
            debug!("Step {} already succeeded, reusing its output", key);
            return Ok(output.clone());
        }

        schema::validate(&tool.input_schema(), &input)?;
        let output = tool.handle(input).await?;
        if let Some(output_schema) = tool.output_schema() {
            schema::validate(&output_schema, &output)?;
        }

        self.checkpoints.insert(key, output.clone());
        Ok(output)
    }

    /// Run an arbitrary step whose output is memoised like a tool's
    pub async fn run_step<T, F, Fut>(&mut self, step: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let key = self.checkpoint_key(step);
        if let Some(output) = self.checkpoints.get(&key) {
            debug!("Step {} already succeeded, reusing its output", key);
            return Ok(serde_json::from_value(output.clone())?);
        }

        let output = f().await?;
        self.checkpoints.insert(key, serde_json::to_value(&output)?);
        Ok(output)
    }
}

/// Source of raw file bytes
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// ## Errors
    /// `Fetch` on transport failure or a non-2xx status
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Plain HTTP(S) GET; the URL is expected to be pre-authorized
pub struct HttpFileFetcher {
    client: reqwest::Client,
}

impl HttpFileFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FileFetcher for HttpFileFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        debug!("Fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!("HTTP {} from {}", status.as_u16(), url)));
        }

        response
            .bytes()
            .await
            .map_err(|e| PipelineError::Fetch(format!("reading body: {}", e)))
    }
}

/// Plain text of a document, page by page
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub pages: usize,
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// ## Errors
    /// `Parse` when the content cannot be read
    async fn extract(&self, bytes: Bytes) -> Result<ExtractedText>;
}

/// PDF text layer extraction with `pdf-extract`, run on the blocking pool
#[derive(Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, bytes: Bytes) -> Result<ExtractedText> {
        if bytes.is_empty() {
            return Err(PipelineError::Parse("file is empty".to_string()));
        }

        let pages = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem_by_pages(&bytes)
                .map_err(|e| PipelineError::Parse(e.to_string()))
        })
        .await
        .map_err(|e| PipelineError::Parse(format!("PDF reader aborted: {}", e)))??;

        Ok(ExtractedText {
            pages: pages.len(),
            text: pages.join("\n"),
        })
    }
}

/// Size in megabytes with two decimals, e.g. `"0.25"`
pub fn size_in_mb(len: usize) -> String {
    format!("{:.2}", len as f64 / (1024.0 * 1024.0))
}

/// Output of [`FetchAndExtractText`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub raw_text: String,
    pub pages: u64,
    pub size_mb: String,
}

/// Fetch a file by URL and extract its plain text and page count
pub struct FetchAndExtractText {
    fetcher: Arc<dyn FileFetcher>,
    extractor: Arc<dyn TextExtractor>,
}

impl FetchAndExtractText {
    pub const NAME: &'static str = "fetch-and-extract-text";

    pub fn new(fetcher: Arc<dyn FileFetcher>, extractor: Arc<dyn TextExtractor>) -> Self {
        Self { fetcher, extractor }
    }

    pub fn input(file_url: &str) -> Value {
        json!({ "file_url": file_url })
    }
}

#[async_trait]
impl Tool for FetchAndExtractText {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn input_schema(&self) -> Schema {
        Schema::object(vec![Field::required("file_url", Schema::non_empty_string())])
    }

    fn output_schema(&self) -> Option<Schema> {
        Some(Schema::object(vec![
            Field::required("raw_text", Schema::string()),
            Field::required("pages", Schema::integer()),
            Field::required("size_mb", Schema::non_empty_string()),
        ]))
    }

    async fn handle(&self, input: Value) -> Result<Value> {
        let file_url = input
            .get("file_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::missing("file_url"))?;

        // A URL that does not parse will never fetch
        url::Url::parse(file_url).map_err(|e| {
            ValidationError::new("file_url", ValidationErrorKind::Malformed(e.to_string()))
        })?;

        let bytes = self.fetcher.fetch(file_url).await?;
        let size_mb = size_in_mb(bytes.len());
        let extracted = self.extractor.extract(bytes).await?;

        info!(
            "Extracted {} pages ({} MB) from {}",
            extracted.pages, size_mb, file_url
        );

        Ok(serde_json::to_value(FetchedDocument {
            raw_text: extracted.text,
            pages: extracted.pages as u64,
            size_mb,
        })?)
    }
}

/// Typed input of [`PersistResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistRequest {
    pub document_id: String,
    pub document_type: Option<DocumentType>,
    pub content: Vec<ContentEntry>,
    pub metadata: DocumentMetadata,
    pub status: DocumentStatus,
}

/// The only component allowed to give a Document Record its terminal status
pub struct PersistResult {
    store: Arc<dyn DocumentStore>,
}

impl PersistResult {
    pub const NAME: &'static str = "persist-result";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for PersistResult {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn input_schema(&self) -> Schema {
        let optional_string = |name: &str| Field::optional(name, Schema::string());
        Schema::object(vec![
            Field::required("document_id", Schema::non_empty_string()),
            Field::required(
                "document_type",
                Schema::enumeration(&DocumentType::names()).nullable(),
            ),
            Field::required(
                "content",
                Schema::nonempty_array(Schema::object(vec![
                    Field::required("key", Schema::non_empty_string()),
                    Field::required("value", Schema::string()),
                ])),
            ),
            Field::required(
                "metadata",
                Schema::object(vec![
                    Field::required("notes", Schema::string()),
                    optional_string("summary"),
                    Field::optional("keywords", Schema::nonempty_array(Schema::string())),
                    optional_string("size_mb"),
                    optional_string("pages"),
                    optional_string("file_name"),
                    optional_string("file_url"),
                ]),
            ),
            Field::required(
                "status",
                Schema::enumeration(&[
                    DocumentStatus::Completed.as_str(),
                    DocumentStatus::RequiresReview.as_str(),
                    DocumentStatus::Failed.as_str(),
                ]),
            ),
        ])
    }

    fn output_schema(&self) -> Option<Schema> {
        Some(Schema::object(vec![
            Field::required("document_id", Schema::non_empty_string()),
            Field::required("status", Schema::non_empty_string()),
        ]))
    }

    async fn handle(&self, input: Value) -> Result<Value> {
        let request: PersistRequest = serde_json::from_value(input)?;
        let record = self
            .store
            .apply_result(
                &request.document_id,
                DocumentUpdate {
                    document_type: request.document_type,
                    content: request.content,
                    metadata: request.metadata,
                    status: request.status,
                },
            )
            .await?;

        info!("Document {} finalized as {}", record.id, record.status);
        Ok(json!({ "document_id": record.id, "status": record.status }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryDocumentStore;
    use crate::models::DocumentRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        body: &'static [u8],
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(self.body))
        }
    }

    struct StaticExtractor;

    #[async_trait]
    impl TextExtractor for StaticExtractor {
        async fn extract(&self, bytes: Bytes) -> Result<ExtractedText> {
            Ok(ExtractedText {
                text: String::from_utf8_lossy(&bytes).to_string(),
                pages: 1,
            })
        }
    }

    fn fetch_tool(fetcher: Arc<StaticFetcher>) -> FetchAndExtractText {
        FetchAndExtractText::new(fetcher, Arc::new(StaticExtractor))
    }

    #[test]
    fn test_size_in_mb() {
        assert_eq!(size_in_mb(0), "0.00");
        assert_eq!(size_in_mb(1024 * 1024), "1.00");
        assert_eq!(size_in_mb(262_144), "0.25");
    }

    #[tokio::test]
    async fn test_invoke_tool_checkpoints_success() {
        let fetcher = Arc::new(StaticFetcher {
            body: b"Invoice INV-1",
            calls: AtomicUsize::new(0),
        });
        let tool = fetch_tool(fetcher.clone());
        let mut checkpoints = BTreeMap::new();

        for _ in 0..2 {
            let mut ctx = StepContext::new(StageId::Extract, &mut checkpoints);
            let output = ctx
                .invoke_tool(&tool, FetchAndExtractText::input("https://x/a.pdf"))
                .await
                .unwrap();
            assert_eq!(output["raw_text"], "Invoice INV-1");
            assert_eq!(output["pages"], 1);
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(checkpoints.contains_key("extract:fetch-and-extract-text"));
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_handler() {
        let fetcher = Arc::new(StaticFetcher {
            body: b"x",
            calls: AtomicUsize::new(0),
        });
        let tool = fetch_tool(fetcher.clone());
        let mut checkpoints = BTreeMap::new();
        let mut ctx = StepContext::new(StageId::Extract, &mut checkpoints);

        let err = ctx.invoke_tool(&tool, json!({ "file_url": "" })).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_url_is_not_retryable() {
        let tool = fetch_tool(Arc::new(StaticFetcher {
            body: b"x",
            calls: AtomicUsize::new(0),
        }));
        let err = tool
            .handle(FetchAndExtractText::input("not a url"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_pdf_extractor_rejects_garbage() {
        let err = PdfTextExtractor
            .extract(Bytes::from_static(b"not a pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
        assert!(matches!(
            PdfTextExtractor.extract(Bytes::new()).await,
            Err(PipelineError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_run_step_memoises_value() {
        let mut checkpoints = BTreeMap::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let mut ctx = StepContext::new(StageId::Extract, &mut checkpoints);
            let text: String = ctx
                .run_step("understand", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("{\"ok\":true}".to_string())
                })
                .await
                .unwrap();
            assert_eq!(text, "{\"ok\":true}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persist_result_writes_record() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        let tool = PersistResult::new(store.clone());

        let input = json!({
            "document_id": "d1",
            "document_type": "receipt",
            "content": [{ "key": "merchant_name", "value": "Cafe" }],
            "metadata": { "notes": "" },
            "status": "completed"
        });
        schema::validate(&tool.input_schema(), &input).unwrap();
        let output = tool.handle(input).await.unwrap();
        assert_eq!(output["status"], "completed");

        let record = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.document_type, Some(DocumentType::Receipt));
        assert_eq!(record.content, vec![ContentEntry::new("merchant_name", "Cafe")]);
    }

    #[tokio::test]
    async fn test_persist_result_schema_rejects_processing_and_empty_content() {
        let tool = PersistResult::new(Arc::new(InMemoryDocumentStore::new()));
        let mut input = json!({
            "document_id": "d1",
            "document_type": null,
            "content": [{ "key": "error", "value": "boom" }],
            "metadata": { "notes": "boom" },
            "status": "processing"
        });
        assert!(schema::validate(&tool.input_schema(), &input).is_err());

        input["status"] = json!("failed");
        assert!(schema::validate(&tool.input_schema(), &input).is_ok());

        input["content"] = json!([]);
        assert!(schema::validate(&tool.input_schema(), &input).is_err());
    }
}
