// Storage abstraction for Document Records
// The pipeline drives the record lifecycle; the store owns the data

//! # Document Store
//!
//! `DocumentStore` is the seam between the pipeline and whatever system owns
//! Document Records. The pipeline touches it in exactly three places:
//! - `begin_processing` once per run, which doubles as the existence check
//! - `apply_result` from the PersistResult tool, the only terminal write
//! - `reset_for_retry` from the explicit retry flow
//!
//! ## Lifecycle Rules
//!
//! ```text
//! pending ──begin_processing──▶ processing ──apply_result──▶ completed
//!                                                       ├──▶ requires_review
//!                                                       └──▶ failed
//! terminal ──reset_for_retry──▶ pending
//! ```
//!
//! A terminal record accepts an `apply_result` only when the update is
//! identical to what it already holds, so a retried persistence attempt is a
//! no-op instead of a second write.
//!
//! ## Thread Safety
//!
//! `InMemoryDocumentStore` keeps records behind a single `RwLock`; each
//! operation takes the write lock once, so updates are atomic per document.
//! `JsonFileDocumentStore` layers a whole-store JSON snapshot on top and
//! rewrites it after every successful mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{DocumentRecord, DocumentStatus, DocumentUpdate};
use crate::{PipelineError, Result};

/// Persistence interface for Document Records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Register a record; stands in for the upload path
    ///
    /// ## Errors
    /// - `Conflict` when a record with this id already exists
    async fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord>;

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Move `pending | processing` to `processing`.
    ///
    /// ## Errors
    /// - `NotFound` when no record has this id
    /// - `AlreadyFinalized` when the record is terminal
    async fn begin_processing(&self, id: &str) -> Result<DocumentRecord>;

    /// Full replacement of the pipeline-owned fields with a terminal status.
    ///
    /// ## Errors
    /// - `NotFound` when no record has this id
    /// - `AlreadyFinalized` when a different terminal result is already stored
    /// - `Conflict` when `update.status` is not terminal
    /// - `Persistence` on storage failure
    async fn apply_result(&self, id: &str, update: DocumentUpdate) -> Result<DocumentRecord>;

    /// Explicit retry flow: move a terminal record back to `pending`
    ///
    /// ## Errors
    /// - `NotFound` when no record has this id
    /// - `Conflict` when the record is not terminal
    async fn reset_for_retry(&self, id: &str) -> Result<DocumentRecord>;

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>>;
}

/// In-memory document store for development, tests and single-process use
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, DocumentRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. from a snapshot taken with `list_documents`
    pub fn from_records(records: impl IntoIterator<Item = DocumentRecord>) -> Self {
        let documents = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            documents: RwLock::new(documents),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, DocumentRecord>>> {
        self.documents
            .write()
            .map_err(|_| PipelineError::Persistence("document store lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, DocumentRecord>>> {
        self.documents
            .read()
            .map_err(|_| PipelineError::Persistence("document store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord> {
        let mut documents = self.write()?;
        if documents.contains_key(&record.id) {
            return Err(PipelineError::Conflict(format!(
                "document {} already exists",
                record.id
            )));
        }
        documents.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn begin_processing(&self, id: &str) -> Result<DocumentRecord> {
        let mut documents = self.write()?;
        let record = documents
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;

        if record.status.is_terminal() {
            return Err(PipelineError::AlreadyFinalized(id.to_string()));
        }
        if record.status != DocumentStatus::Processing {
            record.status = DocumentStatus::Processing;
            record.updated_at = Utc::now();
        }
        Ok(record.clone())
    }

    async fn apply_result(&self, id: &str, update: DocumentUpdate) -> Result<DocumentRecord> {
        if !update.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "refusing non-terminal status {} for document {}",
                update.status, id
            )));
        }

        let mut documents = self.write()?;
        let record = documents
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;

        if record.status.is_terminal() {
            // Replay of the same result
            if record.matches(&update) {
                return Ok(record.clone());
            }
            return Err(PipelineError::AlreadyFinalized(id.to_string()));
        }

        record.apply(update);
        Ok(record.clone())
    }

    async fn reset_for_retry(&self, id: &str) -> Result<DocumentRecord> {
        let mut documents = self.write()?;
        let record = documents
            .get_mut(id)
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;

        if !record.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "document {} is {}, only terminal records can be retried",
                id, record.status
            )));
        }
        record.status = DocumentStatus::Pending;
        record.document_type = None;
        record.content.clear();
        record.metadata = Default::default();
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let mut documents: Vec<DocumentRecord> = self.read()?.values().cloned().collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(documents)
    }
}

/// Document store backed by a single JSON snapshot file
///
/// Records live in memory; the file holds the `list_documents` output and is
/// replaced through a temporary file and a rename.
pub struct JsonFileDocumentStore {
    records: InMemoryDocumentStore,
    path: PathBuf,
    /// Serializes snapshot writes so the newest state lands last
    flush: Mutex<()>,
}

impl JsonFileDocumentStore {
    /// Load the snapshot at `path`, starting empty when the file is absent
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<DocumentRecord>>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} document(s) from {}", records.len(), path.display());
        Ok(Self {
            records: InMemoryDocumentStore::from_records(records),
            path,
            flush: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn snapshot(&self) -> Result<()> {
        let _guard = self.flush.lock().await;
        let records = self.records.list_documents().await?;
        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        let written = async {
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        written.await.map_err(|e| {
            PipelineError::Persistence(format!("writing {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl DocumentStore for JsonFileDocumentStore {
    async fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord> {
        let record = self.records.insert_document(record).await?;
        self.snapshot().await?;
        Ok(record)
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        self.records.get_document(id).await
    }

    async fn begin_processing(&self, id: &str) -> Result<DocumentRecord> {
        let record = self.records.begin_processing(id).await?;
        self.snapshot().await?;
        Ok(record)
    }

    async fn apply_result(&self, id: &str, update: DocumentUpdate) -> Result<DocumentRecord> {
        let record = self.records.apply_result(id, update).await?;
        self.snapshot().await?;
        Ok(record)
    }

    async fn reset_for_retry(&self, id: &str) -> Result<DocumentRecord> {
        let record = self.records.reset_for_retry(id).await?;
        self.snapshot().await?;
        Ok(record)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        self.records.list_documents().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentEntry, DocumentMetadata, DocumentType};

    fn update(status: DocumentStatus, value: &str) -> DocumentUpdate {
        DocumentUpdate {
            document_type: Some(DocumentType::Invoice),
            content: vec![ContentEntry::new("invoice_number", value)],
            metadata: DocumentMetadata::default(),
            status,
        }
    }

    #[tokio::test]
    async fn test_from_records_round_trips_snapshot() {
        let store = InMemoryDocumentStore::new();
        store.insert_document(DocumentRecord::pending("a", "u1")).await.unwrap();
        store.insert_document(DocumentRecord::pending("b", "u1")).await.unwrap();

        let reloaded = InMemoryDocumentStore::from_records(store.list_documents().await.unwrap());
        assert_eq!(reloaded.list_documents().await.unwrap().len(), 2);
        assert!(reloaded.get_document("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();

        let record = store.begin_processing("d1").await.unwrap();
        assert_eq!(record.status, DocumentStatus::Processing);

        let record = store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.content[0].value, "INV-1");
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let store = InMemoryDocumentStore::new();
        assert!(matches!(
            store.begin_processing("nope").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            store
                .apply_result("nope", update(DocumentStatus::Failed, "x"))
                .await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_record_accepts_identical_replay_only() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();

        // Same update again is a no-op
        store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();

        let err = store
            .apply_result("d1", update(DocumentStatus::Failed, "INV-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyFinalized(_)));
        assert!(matches!(
            store.begin_processing("d1").await,
            Err(PipelineError::AlreadyFinalized(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_for_retry_reopens_record() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        store
            .apply_result("d1", update(DocumentStatus::Failed, "x"))
            .await
            .unwrap();

        let record = store.reset_for_retry("d1").await.unwrap();
        assert_eq!(record.status, DocumentStatus::Pending);
        assert!(record.content.is_empty());
        assert!(store.begin_processing("d1").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_non_terminal_update() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        let err = store
            .apply_result("d1", update(DocumentStatus::Processing, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_insert_refuses_existing_id() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        store.begin_processing("d1").await.unwrap();
        store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();

        let err = store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));

        let record = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.content[0].value, "INV-1");
    }

    #[tokio::test]
    async fn test_reset_for_retry_requires_terminal_record() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        assert!(matches!(
            store.reset_for_retry("d1").await,
            Err(PipelineError::Conflict(_))
        ));

        store.begin_processing("d1").await.unwrap();
        assert!(matches!(
            store.reset_for_retry("d1").await,
            Err(PipelineError::Conflict(_))
        ));

        // The live run can still finish
        let record = store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert!(matches!(
            store.reset_for_retry("nope").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("documents.json");

        let store = JsonFileDocumentStore::open(&path).await.unwrap();
        store
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        store
            .insert_document(DocumentRecord::pending("d2", "u1"))
            .await
            .unwrap();
        store.begin_processing("d1").await.unwrap();
        store
            .apply_result("d1", update(DocumentStatus::Completed, "INV-1"))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileDocumentStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_documents().await.unwrap().len(), 2);
        let record = reopened.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.content[0].value, "INV-1");
        assert!(matches!(
            reopened
                .insert_document(DocumentRecord::pending("d1", "u1"))
                .await,
            Err(PipelineError::Conflict(_))
        ));
    }
}
