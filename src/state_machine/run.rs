//! The run record and its transitions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::{
    catalog::{Project, TaskSpec},
    common::{ProjectId, RunId, SiteId},
    error::{CoordinationError, CoordinationResult},
};

/// The state of a run.
///
/// ```text
/// CREATED --> ACTIVE --> COMPLETED
///    |          |
///    |          +------> FAILED
///    +------------------> STOPPED
/// ```
///
/// `Created` can also move straight to `Failed` or `Stopped`. The last three states are terminal
/// and no state is ever entered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Active,
    Completed,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    fn can_move_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Stopped)
                | (Created, Failed)
                | (Active, Completed)
                | (Active, Stopped)
                | (Active, Failed)
        )
    }
}

/// The role a site plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Participant,
}

/// A round that was just opened, together with the task it executes.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOpened {
    pub round: u32,
    pub task: TaskSpec,
}

/// One execution instance of a project.
///
/// The coordinator, participants and tasks are copied from the project when the run is created.
/// They cannot drift afterwards: the coordination service refuses membership changes while a
/// run is pending, and refreshes the task list of a pending run when the project's tasks change.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub coordinator: SiteId,
    pub participants: BTreeSet<SiteId>,
    pub tasks: Vec<TaskSpec>,
    pub state: RunState,
    /// The current round. `0` until the run starts, then the sequence number of the task being
    /// executed.
    pub round: u32,
    /// The participants that delivered a result, per round.
    pub acknowledgments: BTreeMap<u32, BTreeSet<SiteId>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the run was stopped or failed.
    pub reason: Option<String>,
    /// Whether the envelopes of the run were purged from the mailboxes.
    pub(crate) purged: bool,
}

impl Run {
    pub(crate) fn new(project: &Project, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            project_id: project.id,
            coordinator: project.coordinator,
            participants: project.participants.clone(),
            tasks: project.tasks.clone(),
            state: RunState::Created,
            round: 0,
            acknowledgments: BTreeMap::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            reason: None,
            purged: false,
        }
    }

    /// Returns the role the site plays in this run, if any.
    pub fn role_of(&self, site: SiteId) -> Option<Role> {
        if site == self.coordinator {
            Some(Role::Coordinator)
        } else if self.participants.contains(&site) {
            Some(Role::Participant)
        } else {
            None
        }
    }

    /// The number of rounds of the run, one per task.
    pub fn total_rounds(&self) -> u32 {
        self.tasks.len() as u32
    }

    /// The participants that acknowledged the current round.
    pub fn acknowledged(&self) -> BTreeSet<SiteId> {
        self.acknowledgments
            .get(&self.round)
            .cloned()
            .unwrap_or_default()
    }

    /// The participants that have yet to acknowledge the current round, leaving out the
    /// `departed` ones (participants that deregistered in the meantime).
    ///
    /// The run never waits on its own: what to do about an outstanding participant is up to the
    /// coordinator.
    pub fn outstanding(&self, departed: &BTreeSet<SiteId>) -> BTreeSet<SiteId> {
        let acknowledged = self.acknowledgments.get(&self.round);
        self.participants
            .iter()
            .filter(|site| !departed.contains(site))
            .filter(|site| acknowledged.map_or(true, |acks| !acks.contains(site)))
            .copied()
            .collect()
    }

    /// Checks that `site` is the coordinator of the run.
    pub fn ensure_coordinator(&self, site: SiteId, action: &str) -> CoordinationResult<()> {
        if self.role_of(site) == Some(Role::Coordinator) {
            Ok(())
        } else {
            Err(CoordinationError::authorization(format!(
                "only the coordinator of run {} may {}",
                self.id, action
            )))
        }
    }

    /// CREATED -> ACTIVE. Opens round 1.
    pub fn start(&mut self, now: DateTime<Utc>) -> CoordinationResult<RoundOpened> {
        self.ensure_state(RunState::Created, "start")?;
        let task = self
            .tasks
            .first()
            .cloned()
            .ok_or_else(|| CoordinationError::invalid_state("the run has no task to execute"))?;
        if self.participants.is_empty() {
            return Err(CoordinationError::invalid_state(format!(
                "run {} has no participants",
                self.id
            )));
        }
        self.move_to(RunState::Active, now)?;
        self.started_at = Some(now);
        self.round = 1;
        Ok(RoundOpened { round: 1, task })
    }

    /// Marks `participant` as having delivered its result for `round`.
    ///
    /// Returns `false` if the participant had already acknowledged the round.
    pub fn record_round_result(
        &mut self,
        participant: SiteId,
        round: u32,
    ) -> CoordinationResult<bool> {
        self.ensure_state(RunState::Active, "record a round result")?;
        if self.role_of(participant) != Some(Role::Participant) {
            return Err(CoordinationError::authorization(format!(
                "site {} is not a participant of run {}",
                participant, self.id
            )));
        }
        if round != self.round {
            return Err(CoordinationError::invalid_state(format!(
                "run {} is in round {}, not in round {}",
                self.id, self.round, round
            )));
        }
        Ok(self
            .acknowledgments
            .entry(round)
            .or_default()
            .insert(participant))
    }

    /// Opens the next round. Does not require the current round to be fully acknowledged.
    pub fn advance_round(&mut self) -> CoordinationResult<RoundOpened> {
        self.ensure_state(RunState::Active, "advance")?;
        let task = self
            .tasks
            .get(self.round as usize)
            .cloned()
            .ok_or_else(|| {
                CoordinationError::invalid_state(format!(
                    "round {} executes the last task of run {}: complete the run instead",
                    self.round, self.id
                ))
            })?;
        self.round += 1;
        Ok(RoundOpened {
            round: self.round,
            task,
        })
    }

    /// ACTIVE -> COMPLETED, once the round of the last task is acknowledged by every participant
    /// that is not in `departed`.
    pub fn complete(
        &mut self,
        departed: &BTreeSet<SiteId>,
        now: DateTime<Utc>,
    ) -> CoordinationResult<()> {
        self.ensure_state(RunState::Active, "complete")?;
        if self.round < self.total_rounds() {
            return Err(CoordinationError::invalid_state(format!(
                "run {} is in round {} of {}",
                self.id,
                self.round,
                self.total_rounds()
            )));
        }
        let outstanding = self.outstanding(departed);
        if !outstanding.is_empty() {
            return Err(CoordinationError::invalid_state(format!(
                "round {} of run {} still awaits {} participant(s)",
                self.round,
                self.id,
                outstanding.len()
            )));
        }
        self.move_to(RunState::Completed, now)
    }

    /// ACTIVE or CREATED -> STOPPED.
    pub fn stop(&mut self, reason: &str, now: DateTime<Utc>) -> CoordinationResult<()> {
        self.move_to(RunState::Stopped, now)?;
        self.reason = Some(reason.to_string());
        Ok(())
    }

    /// ACTIVE or CREATED -> FAILED.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> CoordinationResult<()> {
        self.move_to(RunState::Failed, now)?;
        self.reason = Some(reason.to_string());
        Ok(())
    }

    fn ensure_state(&self, expected: RunState, action: &str) -> CoordinationResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoordinationError::invalid_state(format!(
                "cannot {} run {} in state {:?}",
                action, self.id, self.state
            )))
        }
    }

    fn move_to(&mut self, next: RunState, now: DateTime<Utc>) -> CoordinationResult<()> {
        if !self.state.can_move_to(next) {
            return Err(CoordinationError::invalid_state(format!(
                "run {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }
}
