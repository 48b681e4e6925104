// Event Trigger - turns inbound `app/pdf` events into workflow runs

//! # Event Trigger
//!
//! Validates an inbound [`TriggerEvent`] and starts exactly one run for it.
//! Event sources deliver at least once, so deliveries that carry an id
//! already seen map back to the run that id started.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::workflow::WorkflowEngine;
use crate::models::{RunState, TriggerEvent};
use crate::Result;

pub struct EventTrigger {
    engine: WorkflowEngine,
    /// Event id -> run id
    seen: DashMap<String, Uuid>,
}

impl EventTrigger {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            seen: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Remember the event ids of runs already in the run store
    pub async fn load_history(&self) -> Result<usize> {
        let runs = self.engine.run_store().list().await?;
        let mut loaded = 0;
        for run in runs {
            if let Some(event_id) = run.event_id {
                self.seen.insert(event_id, run.run_id);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Start a run for `event`, or return the run an earlier delivery started
    pub async fn handle(&self, event: TriggerEvent) -> Result<Uuid> {
        let payload = event.document_event()?;
        let run = RunState::new(payload, event.id.clone());
        let run_id = run.run_id;

        if let Some(event_id) = &event.id {
            // Claim the id before launching; the entry guard is dropped at once
            match self.seen.entry(event_id.clone()) {
                Entry::Occupied(existing) => {
                    let original = *existing.get();
                    info!("Duplicate delivery of event {}, run {}", event_id, original);
                    return Ok(original);
                }
                Entry::Vacant(slot) => {
                    slot.insert(run_id);
                }
            }
        }

        match self.engine.launch(run).await {
            Ok(run_id) => Ok(run_id),
            Err(e) => {
                if let Some(event_id) = &event.id {
                    self.seen.remove(event_id);
                }
                warn!("Could not start run for event {:?}: {}", event.id, e);
                Err(e)
            }
        }
    }

    /// Reopen the Document Record and start a fresh run for it
    ///
    /// The event id is ignored: an explicit retry always starts a new run.
    pub async fn retry_document(&self, event: TriggerEvent) -> Result<Uuid> {
        let payload = event.document_event()?;
        self.engine
            .documents()
            .reset_for_retry(&payload.document_id)
            .await?;
        info!("Retrying document {}", payload.document_id);
        self.engine.start(payload, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{DocumentStore, InMemoryDocumentStore};
    use crate::engine::tools::{ExtractedText, FileFetcher, TextExtractor};
    use crate::llm::TextUnderstanding;
    use crate::models::{DocumentEvent, DocumentRecord, DocumentStatus, RunStatus};
    use crate::PipelineError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixed;

    #[async_trait]
    impl FileFetcher for Fixed {
        async fn fetch(&self, _url: &str) -> crate::Result<Bytes> {
            Ok(Bytes::from_static(b"Boarding pass"))
        }
    }

    #[async_trait]
    impl TextExtractor for Fixed {
        async fn extract(&self, bytes: Bytes) -> crate::Result<ExtractedText> {
            Ok(ExtractedText {
                text: String::from_utf8_lossy(&bytes).to_string(),
                pages: 1,
            })
        }
    }

    #[async_trait]
    impl TextUnderstanding for Fixed {
        async fn understand(&self, _raw_text: &str) -> crate::Result<String> {
            Ok(json!({
                "document_type": "other",
                "classification_confidence": 0.95,
                "extracted_content": { "title": "Boarding pass", "description": null },
                "field_confidence": { "title": 0.95 },
                "summary": "A boarding pass.",
                "keywords": ["travel"]
            })
            .to_string())
        }
    }

    async fn trigger() -> (EventTrigger, Arc<InMemoryDocumentStore>) {
        let documents = Arc::new(InMemoryDocumentStore::new());
        documents
            .insert_document(DocumentRecord::pending("d1", "u1"))
            .await
            .unwrap();
        let engine = WorkflowEngine::builder(documents.clone(), Arc::new(Fixed))
            .fetcher(Arc::new(Fixed))
            .extractor(Arc::new(Fixed))
            .build()
            .unwrap();
        (EventTrigger::new(engine), documents)
    }

    fn event() -> TriggerEvent {
        TriggerEvent::pdf(&DocumentEvent::new("https://x/b.pdf", "u1", "d1", "b.pdf")).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_delivery_returns_original_run() {
        let (trigger, _) = trigger().await;
        let first = trigger.handle(event().with_id("evt-1")).await.unwrap();
        let second = trigger.handle(event().with_id("evt-1")).await.unwrap();
        assert_eq!(first, second);

        trigger
            .engine()
            .wait_for(first, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(trigger.engine().run_store().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_name_and_bad_payload() {
        let (trigger, _) = trigger().await;

        let mut wrong = event();
        wrong.name = "app/image".to_string();
        assert!(matches!(
            trigger.handle(wrong).await.unwrap_err(),
            PipelineError::InvalidEvent(_)
        ));

        let mut missing = event();
        missing.data = json!({ "fileURL": "https://x/b.pdf", "userId": "u1" });
        assert!(matches!(
            trigger.handle(missing).await.unwrap_err(),
            PipelineError::Validation(_)
        ));
        assert!(trigger.engine().run_store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_document_reopens_and_reruns() {
        let (trigger, documents) = trigger().await;
        let first = trigger.handle(event()).await.unwrap();
        trigger
            .engine()
            .wait_for(first, Duration::from_secs(5))
            .await
            .unwrap();

        let second = trigger.retry_document(event()).await.unwrap();
        assert_ne!(first, second);
        let run = trigger
            .engine()
            .wait_for(second, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let record = documents.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_document_refuses_record_in_flight() {
        let (trigger, documents) = trigger().await;
        documents.begin_processing("d1").await.unwrap();

        let err = trigger.retry_document(event()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        assert!(trigger.engine().run_store().list().await.unwrap().is_empty());

        let record = documents.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn test_load_history_restores_dedup() {
        let (trigger, _) = trigger().await;
        let run_id = trigger.handle(event().with_id("evt-9")).await.unwrap();
        trigger
            .engine()
            .wait_for(run_id, Duration::from_secs(5))
            .await
            .unwrap();

        let restarted = EventTrigger::new(trigger.engine().clone());
        assert_eq!(restarted.load_history().await.unwrap(), 1);
        assert_eq!(
            restarted.handle(event().with_id("evt-9")).await.unwrap(),
            run_id
        );
    }
}
