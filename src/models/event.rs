// Inbound trigger events

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{self, Field, Schema};
use crate::{PipelineError, Result};

/// Name of the event that announces an uploaded document
pub const PDF_EVENT_NAME: &str = "app/pdf";

/// Event envelope as delivered by the event source
///
/// `data` stays untyped until it has passed [`DocumentEvent::schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Delivery id; repeated deliveries of one event share it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub data: Value,
}

/// Typed payload of an `app/pdf` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEvent {
    #[serde(rename = "fileURL")]
    pub file_url: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "documentId")]
    pub document_id: String,
    /// Defaults to the last path segment of `fileURL` when the event omits it
    #[serde(default, rename = "fileName")]
    pub file_name: String,
}

impl DocumentEvent {
    pub fn new(
        file_url: impl Into<String>,
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            file_url: file_url.into(),
            user_id: user_id.into(),
            document_id: document_id.into(),
            file_name: file_name.into(),
        }
    }

    pub fn schema() -> Schema {
        Schema::object(vec![
            Field::required("fileURL", Schema::non_empty_string()),
            Field::required("userId", Schema::non_empty_string()),
            Field::required("documentId", Schema::non_empty_string()),
            Field::optional("fileName", Schema::non_empty_string()),
        ])
    }

    /// Display name for a source URL: its last non-empty path segment
    pub fn file_name_from_url(file_url: &str) -> String {
        let segment = match url::Url::parse(file_url) {
            Ok(parsed) => parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(|segment| segment.to_string()),
            // Relative paths
            Err(_) => file_url
                .split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').find(|s| !s.is_empty()))
                .map(|segment| segment.to_string()),
        };
        segment.unwrap_or_else(|| "document.pdf".to_string())
    }
}

impl TriggerEvent {
    /// Build an `app/pdf` event around a document payload
    pub fn pdf(data: &DocumentEvent) -> Result<Self> {
        Ok(Self {
            id: None,
            name: PDF_EVENT_NAME.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Check the event name and turn `data` into a typed payload
    pub fn document_event(&self) -> Result<DocumentEvent> {
        if self.name != PDF_EVENT_NAME {
            return Err(PipelineError::InvalidEvent(format!(
                "expected `{}`, got `{}`",
                PDF_EVENT_NAME, self.name
            )));
        }
        let mut payload: DocumentEvent =
            schema::validate_into(&DocumentEvent::schema(), self.data.clone())?;
        if payload.file_name.is_empty() {
            payload.file_name = DocumentEvent::file_name_from_url(&payload.file_url);
        }
        Ok(payload)
    }
}
