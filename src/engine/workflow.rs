// Workflow Engine - durable, checkpointed execution of pipeline runs

//! # Workflow Engine
//!
//! Drives one run at a time through the stage sequence chosen by the
//! [`Router`]:
//!
//! ```text
//! begin_processing (once, checkpointed)
//! loop {
//!     Router::route(run)
//!       Run(stage)     → attempt up to max_attempts, each under a timeout
//!       Finish(status) → fallback failure write if needed, freeze the run
//! }
//! ```
//!
//! ## Durability
//!
//! The run is saved to the [`RunStore`] after every attempt, together with
//! the checkpoints of the steps that succeeded. A run interrupted by a crash
//! is picked up again by [`WorkflowEngine::resume_pending`]; the router sees
//! the persisted results and completed steps are not repeated. A step that
//! succeeded but whose checkpoint was not yet saved runs again, so execution
//! is at-least-once.
//!
//! ## Error Containment
//!
//! Stage errors never leave the loop. They become [`StageOutcome::Failure`]
//! entries, and the router turns the last one into `Finish(Failed)`. Only
//! infrastructure errors (the run store itself failing) propagate out of
//! [`WorkflowEngine::execute`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventBus, RunEvent, RunEventKind};
use super::router::{Route, Router};
use super::run_store::{InMemoryRunStore, RunStore};
use super::stages::{ExtractionStage, PersistenceStage, Stage};
use super::storage::DocumentStore;
use super::tools::{
    FetchAndExtractText, FileFetcher, HttpFileFetcher, PdfTextExtractor, PersistResult,
    StepContext, TextExtractor,
};
use crate::llm::TextUnderstanding;
use crate::models::{
    DocumentEvent, ErrorSummary, RunState, RunStatus, StageId, StageInvocation, StageOutcome,
};
use crate::{PipelineError, Result};

/// Checkpoint key marking that the Document Record was moved to `processing`
pub const BEGIN_PROCESSING_KEY: &str = "engine:begin-processing";

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * multiplier^(attempt-1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.base_delay.mul_f64(self.multiplier.powi(exponent))
    }

    /// Whether a failure on `attempt` should be followed by another attempt
    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub extraction_timeout: Duration,
    pub persistence_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            extraction_timeout: Duration::from_secs(60),
            persistence_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

struct EngineInner {
    router: Router,
    stages: HashMap<StageId, Arc<dyn Stage>>,
    persistence: Arc<PersistenceStage>,
    documents: Arc<dyn DocumentStore>,
    runs: Arc<dyn RunStore>,
    events: EventBus,
    retry: RetryPolicy,
    /// Runs currently being driven by this process
    active: DashMap<Uuid, ()>,
}

/// Removes a run from the active set when execution ends
struct ActiveRun<'a> {
    active: &'a DashMap<Uuid, ()>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Cheap to clone; clones share stores, stages and the event bus
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    documents: Arc<dyn DocumentStore>,
    understanding: Arc<dyn TextUnderstanding>,
    runs: Option<Arc<dyn RunStore>>,
    fetcher: Option<Arc<dyn FileFetcher>>,
    extractor: Option<Arc<dyn TextExtractor>>,
    router: Router,
    events: Option<EventBus>,
}

impl WorkflowEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn FileFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        let fetcher: Arc<dyn FileFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFileFetcher::new(self.config.fetch_timeout)?),
        };
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(PdfTextExtractor) as Arc<dyn TextExtractor>);

        let extraction = Arc::new(ExtractionStage::new(
            FetchAndExtractText::new(fetcher, extractor),
            self.understanding,
            self.config.extraction_timeout,
        ));
        let persistence = Arc::new(PersistenceStage::new(
            PersistResult::new(Arc::clone(&self.documents)),
            self.config.persistence_timeout,
        ));

        let mut stages: HashMap<StageId, Arc<dyn Stage>> = HashMap::new();
        stages.insert(extraction.id(), extraction);
        stages.insert(persistence.id(), persistence.clone());

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                router: self.router,
                stages,
                persistence,
                documents: self.documents,
                runs: self
                    .runs
                    .unwrap_or_else(|| Arc::new(InMemoryRunStore::new()) as Arc<dyn RunStore>),
                events: self.events.unwrap_or_default(),
                retry: self.config.retry,
                active: DashMap::new(),
            }),
        })
    }
}

impl WorkflowEngine {
    pub fn builder(
        documents: Arc<dyn DocumentStore>,
        understanding: Arc<dyn TextUnderstanding>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config: EngineConfig::default(),
            documents,
            understanding,
            runs: None,
            fetcher: None,
            extractor: None,
            router: Router::default(),
            events: None,
        }
    }

    pub fn documents(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.inner.documents)
    }

    pub fn run_store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.inner.runs)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunState>> {
        self.inner.runs.load(run_id).await
    }

    /// Create a run for `payload` and execute it in the background
    pub async fn start(&self, payload: DocumentEvent, event_id: Option<String>) -> Result<Uuid> {
        self.launch(RunState::new(payload, event_id)).await
    }

    /// Persist a freshly created run and spawn its execution
    pub async fn launch(&self, run: RunState) -> Result<Uuid> {
        let run_id = run.run_id;
        self.inner.runs.save(&run).await?;
        info!(
            "Run {} started for document {}",
            run_id, run.payload.document_id
        );
        self.inner.events.publish(
            run_id,
            RunEventKind::RunStarted {
                document_id: run.payload.document_id.clone(),
            },
        );
        self.spawn(run_id);
        Ok(run_id)
    }

    fn spawn(&self, run_id: Uuid) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute(run_id).await {
                error!("Run {} aborted: {}", run_id, e);
            }
        });
    }

    /// Spawn every run still marked running, e.g. after a restart
    pub async fn resume_pending(&self) -> Result<Vec<Uuid>> {
        let pending = self.inner.runs.list_running().await?;
        let ids: Vec<Uuid> = pending.iter().map(|run| run.run_id).collect();
        for run_id in &ids {
            info!("Resuming run {}", run_id);
            self.spawn(*run_id);
        }
        Ok(ids)
    }

    /// Drive every pending run to completion in this task
    pub async fn drive_pending(&self) -> Result<Vec<Result<RunState>>> {
        let pending = self.inner.runs.list_running().await?;
        Ok(join_all(pending.iter().map(|run| self.execute(run.run_id))).await)
    }

    /// Poll the run store until the run leaves the running state
    pub async fn wait_for(&self, run_id: Uuid, timeout: Duration) -> Result<RunState> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.runs.load(&run_id).await? {
                Some(run) if !run.is_running() => return Ok(run),
                Some(_) => {}
                None => return Err(PipelineError::NotFound(format!("run {}", run_id))),
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::Timeout {
                    stage: "wait".to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drive a run until the router finishes it
    pub async fn execute(&self, run_id: Uuid) -> Result<RunState> {
        if self.inner.active.insert(run_id, ()).is_some() {
            return Err(PipelineError::Stage(format!("run {} is already executing", run_id)));
        }
        let _active = ActiveRun {
            active: &self.inner.active,
            run_id,
        };

        let mut run = self
            .inner
            .runs
            .load(&run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("run {}", run_id)))?;
        if !run.is_running() {
            debug!("Run {} already finished as {}", run_id, run.status);
            return Ok(run);
        }

        if run.results.is_empty() && !run.checkpoints.contains_key(BEGIN_PROCESSING_KEY) {
            self.begin_processing(&mut run).await?;
        }

        loop {
            match self.inner.router.route(&run) {
                Route::Run(stage_id) => self.run_stage(&mut run, stage_id).await?,
                Route::Finish(status) => {
                    self.finish(&mut run, status).await?;
                    return Ok(run);
                }
            }
        }
    }

    /// Run `op` under the retry policy
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if self.inner.retry.should_retry(&e, attempt) => {
                    let delay = self.inner.retry.delay_for(attempt);
                    warn!("{} failed (attempt {}), retrying in {:?}: {}", what, attempt, delay, e);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Move the Document Record to `processing`; this is also the existence check
    async fn begin_processing(&self, run: &mut RunState) -> Result<()> {
        let document_id = run.payload.document_id.clone();
        let documents = &self.inner.documents;
        let id = document_id.as_str();
        let outcome = self
            .with_retry("begin processing", move || documents.begin_processing(id))
            .await;

        match outcome {
            Ok(record) => {
                run.record_checkpoint(BEGIN_PROCESSING_KEY, json!({ "status": record.status }))?;
            }
            Err(e) => {
                error!("Run {} cannot start on document {}: {}", run.run_id, document_id, e);
                let first = self
                    .inner
                    .router
                    .first()
                    .unwrap_or(StageId::Extract);
                run.record_result(first, StageOutcome::Failure(ErrorSummary::from(&e)))?;
            }
        }
        self.inner.runs.save(run).await
    }

    fn stage(&self, stage_id: StageId) -> Result<Arc<dyn Stage>> {
        self.inner
            .stages
            .get(&stage_id)
            .cloned()
            .ok_or_else(|| PipelineError::Stage(format!("no stage registered for {}", stage_id)))
    }

    /// Execute one stage with retries and record exactly one result for it
    async fn run_stage(&self, run: &mut RunState, stage_id: StageId) -> Result<()> {
        let stage = self.stage(stage_id)?;
        let run_id = run.run_id;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.inner
                .events
                .publish(run_id, RunEventKind::StageStarted { stage: stage_id, attempt });
            debug!("Run {} stage {} attempt {}", run_id, stage_id, attempt);

            let started_at = Utc::now();
            let clock = Instant::now();
            let input = run.view().snapshot();
            let mut checkpoints = run.checkpoints.clone();

            let result = {
                let mut ctx = StepContext::new(stage_id, &mut checkpoints);
                match tokio::time::timeout(stage.timeout(), stage.run(run.view(), &mut ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout {
                        stage: stage_id.to_string(),
                        after_ms: stage.timeout().as_millis() as u64,
                    }),
                }
            };

            // Keep whatever steps finished, even when the attempt as a whole failed
            for (key, value) in checkpoints {
                if !run.checkpoints.contains_key(&key) {
                    run.record_checkpoint(key, value)?;
                }
            }

            let outcome = match &result {
                Ok(value) => StageOutcome::Success(value.clone()),
                Err(e) => StageOutcome::Failure(ErrorSummary::from(e)),
            };
            run.record_invocation(StageInvocation {
                stage: stage_id,
                attempt,
                input,
                outcome: outcome.clone(),
                duration_ms: clock.elapsed().as_millis() as u64,
                started_at,
            })?;

            match result {
                Ok(_) => {
                    info!("Run {} stage {} succeeded on attempt {}", run_id, stage_id, attempt);
                }
                Err(e) if self.inner.retry.should_retry(&e, attempt) => {
                    self.inner.runs.save(run).await?;
                    let delay = self.inner.retry.delay_for(attempt);
                    warn!(
                        "Run {} stage {} attempt {} failed, retrying in {:?}: {}",
                        run_id, stage_id, attempt, delay, e
                    );
                    self.inner.events.publish(
                        run_id,
                        RunEventKind::StageRetrying {
                            stage: stage_id,
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: ErrorSummary::from(&e),
                        },
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    error!(
                        "Run {} stage {} failed after {} attempt(s): {}",
                        run_id, stage_id, attempt, e
                    );
                }
            }

            let success = outcome.is_success();
            run.record_result(stage_id, outcome)?;
            self.inner.runs.save(run).await?;
            self.inner
                .events
                .publish(run_id, RunEventKind::StageCompleted { stage: stage_id, success });
            return Ok(());
        }
    }

    async fn finish(&self, run: &mut RunState, status: RunStatus) -> Result<()> {
        let last_error = run.view().last_error().cloned();

        if status == RunStatus::Failed {
            if run.checkpoints.contains_key(BEGIN_PROCESSING_KEY) {
                self.record_failure(run).await?;
            } else {
                debug!(
                    "Run {} never claimed document {}, skipping failure write",
                    run.run_id, run.payload.document_id
                );
            }
        }

        let error = match status {
            RunStatus::Failed => last_error,
            _ => None,
        };
        run.finish(status, error)?;
        self.inner.runs.save(run).await?;

        match status {
            RunStatus::Failed => error!("Run {} finished as failed", run.run_id),
            _ => info!("Run {} finished as {}", run.run_id, status),
        }
        self.inner
            .events
            .publish(run.run_id, RunEventKind::RunFinished { status });
        Ok(())
    }

    /// Best-effort failure write; its attempts are kept as invocations
    async fn record_failure(&self, run: &mut RunState) -> Result<()> {
        let summary = run
            .view()
            .last_error()
            .map(|error| error.message.clone())
            .unwrap_or_else(|| "run failed".to_string());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started_at = Utc::now();
            let clock = Instant::now();
            let mut checkpoints = run.checkpoints.clone();

            let result = {
                let mut ctx = StepContext::new(StageId::Persist, &mut checkpoints);
                let write = self
                    .inner
                    .persistence
                    .record_failure(run.view(), &mut ctx, &summary);
                match tokio::time::timeout(self.inner.persistence.timeout(), write).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout {
                        stage: "record-failure".to_string(),
                        after_ms: self.inner.persistence.timeout().as_millis() as u64,
                    }),
                }
            };

            for (key, value) in checkpoints {
                if !run.checkpoints.contains_key(&key) {
                    run.record_checkpoint(key, value)?;
                }
            }

            let outcome = match &result {
                Ok(value) => StageOutcome::Success(value.clone()),
                Err(e) => StageOutcome::Failure(ErrorSummary::from(e)),
            };
            run.record_invocation(StageInvocation {
                stage: StageId::Persist,
                attempt,
                input: json!({ "fallback": true, "summary": summary }),
                outcome,
                duration_ms: clock.elapsed().as_millis() as u64,
                started_at,
            })?;

            match result {
                Ok(_) => {
                    info!(
                        "Document {} marked failed by run {}",
                        run.payload.document_id, run.run_id
                    );
                    return Ok(());
                }
                Err(e) if self.inner.retry.should_retry(&e, attempt) => {
                    self.inner.runs.save(run).await?;
                    tokio::time::sleep(self.inner.retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    warn!(
                        "Could not mark document {} failed: {}",
                        run.payload.document_id, e
                    );
                    return Ok(());
                }
            }
        }
    }
}

/// Output of a finished run's last successful stage, if any
pub fn final_output(run: &RunState) -> Option<&Value> {
    run.results.iter().rev().find_map(|result| match &result.outcome {
        StageOutcome::Success(value) => Some(value),
        StageOutcome::Failure(_) => None,
    })
}
