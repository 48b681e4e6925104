// Run state persistence
// Runs are saved after every stage attempt so they can be resumed

//! # Run Store
//!
//! The engine writes the full [`RunState`] after every attempt. After a
//! restart, [`RunStore::list_running`] returns the runs that never reached a
//! terminal status and the engine re-drives them from their persisted
//! `call_count`, results and checkpoints.
//!
//! Two backends:
//! - `InMemoryRunStore` for tests and single-process deployments
//! - `JsonFileRunStore`, one `<run_id>.json` file per run, written through a
//!   temporary file and a rename so a crash never leaves a torn file

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::RunState;
use crate::{PipelineError, Result};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run
    async fn save(&self, run: &RunState) -> Result<()>;

    async fn load(&self, run_id: &Uuid) -> Result<Option<RunState>>;

    async fn list(&self) -> Result<Vec<RunState>>;

    /// Runs still in the running state
    async fn list_running(&self) -> Result<Vec<RunState>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(RunState::is_running)
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, RunState>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PipelineError {
    PipelineError::Persistence("run store lock poisoned".to_string())
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &RunState) -> Result<()> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<RunState>> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.get(run_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut all: Vec<RunState> = runs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

/// File-backed run store, one JSON document per run
pub struct JsonFileRunStore {
    dir: PathBuf,
}

impl JsonFileRunStore {
    /// Open (and create if needed) a run directory
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl RunStore for JsonFileRunStore {
    async fn save(&self, run: &RunState) -> Result<()> {
        let path = self.path_for(&run.run_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(run)?;

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved run {} to {}", run.run_id, path.display());
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<RunState>> {
        let path = self.path_for(run_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RunState>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping unreadable run file {}: {}", path.display(), e),
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentEvent, RunStatus};

    fn run() -> RunState {
        RunState::new(DocumentEvent::new("https://x/a.pdf", "u1", "d1", "a.pdf"), None)
    }

    #[tokio::test]
    async fn test_in_memory_lists_running_only() {
        let store = InMemoryRunStore::new();
        let open = run();
        let mut done = run();
        done.finish(RunStatus::Completed, None).unwrap();
        store.save(&open).await.unwrap();
        store.save(&done).await.unwrap();

        let running = store.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, open.run_id);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state = run();
        {
            let store = JsonFileRunStore::open(dir.path()).await.unwrap();
            store.save(&state).await.unwrap();
        }

        let store = JsonFileRunStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load(&state.run_id).await.unwrap(), Some(state.clone()));
        assert_eq!(store.list_running().await.unwrap().len(), 1);
        assert_eq!(store.load(&Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_store_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{")
            .await
            .unwrap();

        let store = JsonFileRunStore::open(dir.path()).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
