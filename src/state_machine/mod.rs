//! The run lifecycle.
//!
//! The [`RunStateMachine`] owns every [`Run`]. A run is always mutated under its own lock: the
//! coordination service locks the run, applies a transition to a copy of it, and only commits the
//! copy once every other effect of the operation (relay appends, mostly) is known to succeed.

pub mod commands;
pub mod run;

use chrono::{DateTime, Utc};
use tracing::info;

pub use self::{
    commands::RunCommand,
    run::{Role, RoundOpened, Run, RunState},
};
use crate::{
    catalog::Project,
    common::{RunId, SiteId},
    error::{CoordinationError, CoordinationResult},
    storage::{RowGuard, Table},
};

/// The store of all the runs.
#[derive(Debug, Default)]
pub struct RunStateMachine {
    runs: Table<RunId, Run>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a run of `project` in the CREATED state.
    ///
    /// The caller must hold the lock of the project for the duration of the call: this is what
    /// keeps two concurrent creations from both observing that no run is pending.
    ///
    /// # Errors
    /// - authorization error if `initiator` is not the project's coordinator;
    /// - conflict if another run of the project is not terminal yet.
    pub async fn create_run(
        &self,
        project: &mut Project,
        initiator: SiteId,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Run> {
        if initiator != project.coordinator {
            return Err(CoordinationError::authorization(format!(
                "only the coordinator of project {} may create a run",
                project.id
            )));
        }
        if let Some(pending) = self.pending_run(&project.runs).await {
            return Err(CoordinationError::conflict(format!(
                "run {} of project {} is still {:?}",
                pending.id, project.id, pending.state
            )));
        }

        let run = Run::new(project, now);
        self.runs.insert(run.id, run.clone()).await;
        project.runs.push(run.id);

        info!(run_id = %run.id, project_id = %project.id, "run created");
        Ok(run)
    }

    /// Locks a run for a read-modify-write cycle.
    pub async fn lock(&self, id: RunId) -> CoordinationResult<RowGuard<Run>> {
        self.runs
            .lock(&id)
            .await
            .ok_or(CoordinationError::UnknownRun(id))
    }

    pub async fn run(&self, id: RunId) -> CoordinationResult<Run> {
        self.runs
            .get(&id)
            .await
            .ok_or(CoordinationError::UnknownRun(id))
    }

    /// Returns copies of the given runs, skipping unknown ids.
    pub async fn runs(&self, ids: &[RunId]) -> Vec<Run> {
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = self.runs.get(id).await {
                runs.push(run);
            }
        }
        runs
    }

    /// Returns the first run among `ids` that is not terminal, if any.
    pub async fn pending_run(&self, ids: &[RunId]) -> Option<Run> {
        for id in ids {
            match self.runs.get(id).await {
                Some(run) if !run.state.is_terminal() => return Some(run),
                _ => {}
            }
        }
        None
    }

    /// Marks the terminal runs that ended before `cutoff` as purged and returns their ids.
    ///
    /// A run is only ever returned once.
    pub async fn retire_ended_before(&self, cutoff: DateTime<Utc>) -> Vec<RunId> {
        let mut retired = Vec::new();
        for id in self.runs.keys().await {
            if let Some(mut run) = self.runs.lock(&id).await {
                let expired = run.state.is_terminal()
                    && !run.purged
                    && run.ended_at.map_or(false, |ended| ended < cutoff);
                if expired {
                    run.purged = true;
                    retired.push(id);
                }
            }
        }
        retired
    }
}
