// Router - pure function from run state to the next step

//! # Router
//!
//! Holds an ordered stage sequence and decides, from the run's results alone,
//! whether to run another stage or finish:
//!
//! | run state                               | route                 |
//! |-----------------------------------------|-----------------------|
//! | no results yet                          | `Run(first stage)`    |
//! | last result failed                      | `Finish(Failed)`      |
//! | last result succeeded, a stage follows  | `Run(next stage)`     |
//! | sequence exhausted                      | `Finish(Completed)`   |
//!
//! Stages are named tokens rather than call-count thresholds, so adding a
//! stage only extends the sequence.

use serde::{Deserialize, Serialize};

pub use crate::models::StageId;
use crate::models::{RunState, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", content = "target", rename_all = "snake_case")]
pub enum Route {
    Run(StageId),
    Finish(RunStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    sequence: Vec<StageId>,
}

impl Router {
    pub fn new(sequence: Vec<StageId>) -> Self {
        Self { sequence }
    }

    pub fn sequence(&self) -> &[StageId] {
        &self.sequence
    }

    pub fn first(&self) -> Option<StageId> {
        self.sequence.first().copied()
    }

    pub fn route(&self, run: &RunState) -> Route {
        let Some(last) = run.results.last() else {
            return match self.first() {
                Some(stage) => Route::Run(stage),
                None => Route::Finish(RunStatus::Completed),
            };
        };

        if !last.outcome.is_success() {
            return Route::Finish(RunStatus::Failed);
        }
        // Each completed stage advances the call count by one
        match self.sequence.get(run.call_count as usize) {
            Some(stage) => Route::Run(*stage),
            None => Route::Finish(RunStatus::Completed),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(vec![StageId::Extract, StageId::Persist])
    }
}
