// Document Record domain model
// The record is owned by an external store; this pipeline only drives its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of document classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Receipt,
    Resume,
    FlightTicket,
    Other,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Invoice,
        DocumentType::Receipt,
        DocumentType::Resume,
        DocumentType::FlightTicket,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Receipt => "receipt",
            DocumentType::Resume => "resume",
            DocumentType::FlightTicket => "flight_ticket",
            DocumentType::Other => "other",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document Record lifecycle status
///
/// `pending -> processing -> (completed | requires_review | failed)`.
/// Only `reset_for_retry` leads out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RequiresReview,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Failed | DocumentStatus::RequiresReview
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::RequiresReview => "requires_review",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flattened `key -> value` pair of extracted content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub key: String,
    pub value: String,
}

impl ContentEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Summary information stored next to the content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Review reasons or the failure summary; empty when neither applies
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

/// The full replacement applied when a run finalizes a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub document_type: Option<DocumentType>,
    pub content: Vec<ContentEntry>,
    pub metadata: DocumentMetadata,
    pub status: DocumentStatus,
}

/// Persisted document record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub owner_id: String,
    pub status: DocumentStatus,
    pub document_type: Option<DocumentType>,
    pub content: Vec<ContentEntry>,
    pub metadata: DocumentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// A freshly uploaded record awaiting processing
    pub fn pending(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            status: DocumentStatus::Pending,
            document_type: None,
            content: Vec::new(),
            metadata: DocumentMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether applying `update` would leave the record unchanged
    pub fn matches(&self, update: &DocumentUpdate) -> bool {
        self.status == update.status
            && self.document_type == update.document_type
            && self.content == update.content
            && self.metadata == update.metadata
    }

    /// Replace every pipeline-owned field with `update`
    pub fn apply(&mut self, update: DocumentUpdate) {
        self.status = update.status;
        self.document_type = update.document_type;
        self.content = update.content;
        self.metadata = update.metadata;
        self.updated_at = Utc::now();
    }
}
