//! The coordination service: the single entry point of every caller of the Router.
//!
//! [`CoordinationService`] composes the registry, the catalog, the run state machine and the
//! relay. Operations that touch several components acquire their locks in the order documented
//! in [`crate::storage`] and validate everything before mutating anything, so that a failed
//! operation leaves no trace.

pub mod sweeper;

use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::{
    catalog::{NewProject, Project, ProjectCatalog, TaskSpec},
    common::{EnvelopeId, ProjectId, RunId, SiteId},
    error::{CoordinationError, CoordinationResult},
    registry::{Site, SiteRegistry, SiteStatus},
    relay::{Envelope, EnvelopeKind, MessageRelay, Outgoing, PreparedEnvelope},
    state_machine::{RunCommand, Run, RunState, RunStateMachine},
};

/// A snapshot of a run, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub coordinator: SiteId,
    pub state: RunState,
    pub round: u32,
    pub total_rounds: u32,
    pub participants: Vec<SiteId>,
    /// The participants that delivered a result for the current round.
    pub acknowledged: Vec<SiteId>,
    /// The participants the current round still waits for. Deregistered participants are never
    /// waited for.
    pub outstanding: Vec<SiteId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl RunView {
    fn new(run: &Run, departed: &BTreeSet<SiteId>) -> Self {
        Self {
            run_id: run.id,
            project_id: run.project_id,
            coordinator: run.coordinator,
            state: run.state,
            round: run.round,
            total_rounds: run.total_rounds(),
            participants: run.participants.iter().copied().collect(),
            acknowledged: run.acknowledged().into_iter().collect(),
            outstanding: run.outstanding(departed).into_iter().collect(),
            created_at: run.created_at,
            started_at: run.started_at,
            ended_at: run.ended_at,
            reason: run.reason.clone(),
        }
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// The sites that were marked unreachable.
    pub unreachable: Vec<SiteId>,
    /// The terminal runs whose envelopes were purged.
    pub purged_runs: Vec<RunId>,
    /// The number of envelopes purged.
    pub purged_envelopes: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.unreachable.is_empty() && self.purged_runs.is_empty()
    }
}

/// The coordination service.
#[derive(Debug, Default)]
pub struct CoordinationService {
    registry: SiteRegistry,
    catalog: ProjectCatalog,
    runs: RunStateMachine,
    relay: MessageRelay,
}

impl CoordinationService {
    /// Creates a service.
    ///
    /// * `allowed_models`: the model kinds tasks may use, any if empty.
    /// * `max_payload_size`: the maximum size of an envelope payload, in bytes.
    pub fn new(allowed_models: Vec<String>, max_payload_size: usize) -> Self {
        Self {
            registry: SiteRegistry::new(),
            catalog: ProjectCatalog::new(allowed_models),
            runs: RunStateMachine::new(),
            relay: MessageRelay::new(max_payload_size),
        }
    }

    // sites

    pub async fn register_site(
        &self,
        name: &str,
        description: &str,
        declared_identity: &str,
    ) -> CoordinationResult<Site> {
        self.registry
            .register(name, description, declared_identity)
            .await
    }

    pub async fn heartbeat(&self, site: SiteId) -> CoordinationResult<DateTime<Utc>> {
        self.registry.heartbeat(site).await
    }

    pub async fn update_site(
        &self,
        site: SiteId,
        name: &str,
        description: &str,
    ) -> CoordinationResult<Site> {
        self.registry.update(site, name, description).await
    }

    pub async fn get_site(&self, site: SiteId) -> CoordinationResult<Site> {
        self.registry.site(site).await
    }

    pub async fn lookup_site(&self, declared_identity: &str) -> CoordinationResult<Site> {
        self.registry.lookup(declared_identity).await
    }

    pub async fn mark_unreachable(&self, site: SiteId) -> CoordinationResult<SiteStatus> {
        self.registry.mark_unreachable(site).await
    }

    /// Deregisters a site.
    ///
    /// # Errors
    /// - unknown site if the site is unknown or already deregistered;
    /// - conflict if the site coordinates or participates in a project whose current run is
    ///   not terminal.
    pub async fn deregister_site(&self, site: SiteId) -> CoordinationResult<()> {
        self.registry.live_site(site).await?;

        // hold every involved project until the site is gone, so that no run can be created
        // in between; sorted ids keep concurrent deregistrations from deadlocking
        let mut ids = self.catalog.ids().await;
        ids.sort();
        let mut involved = Vec::new();
        for id in ids {
            let project = self.catalog.lock(id).await?;
            if project.involves(site) {
                involved.push(project);
            }
        }
        for project in &involved {
            if let Some(run) = self.runs.pending_run(&project.runs).await {
                return Err(CoordinationError::conflict(format!(
                    "site {} is engaged in run {} of project {}",
                    site, run.id, project.id
                )));
            }
        }
        self.registry.deregister(site).await
    }

    // projects

    pub async fn create_project(&self, new: NewProject) -> CoordinationResult<Project> {
        self.catalog.create(&self.registry, new).await
    }

    pub async fn get_project(&self, project: ProjectId) -> CoordinationResult<Project> {
        self.catalog.project(project).await
    }

    pub async fn lookup_project(&self, name: &str) -> CoordinationResult<Project> {
        self.catalog.by_name(name).await
    }

    /// Returns every project the site coordinates or participates in.
    pub async fn list_projects(&self, site: SiteId) -> CoordinationResult<Vec<Project>> {
        self.registry.site(site).await?;
        Ok(self.catalog.projects_of(site).await)
    }

    /// Replaces the task list of a project.
    ///
    /// A run of the project that is still CREATED picks up the new tasks.
    ///
    /// # Errors
    /// - authorization error if `initiator` is not the coordinator of the project;
    /// - validation error if the task list is invalid;
    /// - conflict if a run of the project has left the created state.
    pub async fn update_tasks(
        &self,
        project_id: ProjectId,
        initiator: SiteId,
        tasks: Vec<TaskSpec>,
    ) -> CoordinationResult<Project> {
        let mut project = self.catalog.lock(project_id).await?;
        if initiator != project.coordinator {
            return Err(CoordinationError::authorization(format!(
                "only the coordinator of project {} may change its tasks",
                project_id
            )));
        }
        let tasks = self.catalog.check_tasks(tasks)?;

        let mut pending = Vec::new();
        for id in project.runs.iter().copied() {
            let run = self.runs.lock(id).await?;
            if run.state != RunState::Created {
                return Err(CoordinationError::conflict(format!(
                    "run {} of project {} already left the created state",
                    id, project_id
                )));
            }
            pending.push(run);
        }
        for run in pending.iter_mut() {
            run.tasks = tasks.clone();
        }
        project.tasks = tasks;

        info!(project_id = %project_id, tasks = project.tasks.len(), "project tasks updated");
        Ok(project.clone())
    }

    /// Adds a participant to a project.
    ///
    /// # Errors
    /// - conflict if the project has a run that is not terminal, the site coordinates the
    ///   project or already participates in it;
    /// - unknown site if the site is unknown or deregistered.
    pub async fn join_project(
        &self,
        project_id: ProjectId,
        site: SiteId,
    ) -> CoordinationResult<Project> {
        let mut project = self.catalog.lock(project_id).await?;
        self.ensure_no_pending_run(&project, "join").await?;
        self.registry.live_site(site).await?;
        project.add_participant(site)?;
        info!(project_id = %project_id, site_id = %site, "site joined project");
        Ok(project.clone())
    }

    /// Removes a participant from a project.
    ///
    /// # Errors
    /// - conflict if the project has a run that is not terminal;
    /// - validation error if the site does not participate in the project.
    pub async fn leave_project(
        &self,
        project_id: ProjectId,
        site: SiteId,
    ) -> CoordinationResult<Project> {
        let mut project = self.catalog.lock(project_id).await?;
        self.ensure_no_pending_run(&project, "leave").await?;
        project.remove_participant(site)?;
        info!(project_id = %project_id, site_id = %site, "site left project");
        Ok(project.clone())
    }

    // runs

    /// Creates a run of a project.
    ///
    /// # Errors
    /// - unknown site if the initiator is unknown or deregistered;
    /// - authorization error if the initiator is not the coordinator or is unreachable;
    /// - conflict if another run of the project is not terminal.
    pub async fn create_run(
        &self,
        project_id: ProjectId,
        initiator: SiteId,
    ) -> CoordinationResult<RunView> {
        let mut project = self.catalog.lock(project_id).await?;
        let site = self.registry.live_site(initiator).await?;
        if site.status == SiteStatus::Unreachable {
            return Err(CoordinationError::authorization(format!(
                "unreachable site {} cannot initiate a run",
                initiator
            )));
        }
        let run = self
            .runs
            .create_run(&mut project, initiator, Utc::now())
            .await?;
        Ok(self.view(&run).await)
    }

    /// Starts a run and broadcasts the first task to the participants.
    pub async fn start_run(&self, run_id: RunId, initiator: SiteId) -> CoordinationResult<RunView> {
        let mut run = self.runs.lock(run_id).await?;
        run.ensure_coordinator(initiator, "start")?;

        let now = Utc::now();
        let mut next = run.clone();
        let opened = next.start(now)?;
        let commands = self.prepare_broadcast(
            &next,
            RunCommand::Start {
                run_id,
                round: opened.round,
                task: opened.task,
            },
        )?;
        *run = next;
        self.deliver_all(commands, now).await;

        info!(run_id = %run_id, participants = run.participants.len(), "run started");
        Ok(self.view(&run).await)
    }

    /// Opens the next round of a run and broadcasts its task to the participants.
    ///
    /// The current round does not need to be fully acknowledged: whether to wait for a
    /// participant is up to the coordinator.
    pub async fn advance_round(
        &self,
        run_id: RunId,
        initiator: SiteId,
    ) -> CoordinationResult<RunView> {
        let mut run = self.runs.lock(run_id).await?;
        run.ensure_coordinator(initiator, "advance")?;

        let now = Utc::now();
        let mut next = run.clone();
        let skipped = next.outstanding(&self.departed(&next).await).len();
        let opened = next.advance_round()?;
        let commands = self.prepare_broadcast(
            &next,
            RunCommand::Start {
                run_id,
                round: opened.round,
                task: opened.task,
            },
        )?;
        *run = next;
        self.deliver_all(commands, now).await;

        if skipped > 0 {
            warn!(
                run_id = %run_id,
                round = run.round,
                skipped,
                "round advanced without every result"
            );
        } else {
            info!(run_id = %run_id, round = run.round, "round advanced");
        }
        Ok(self.view(&run).await)
    }

    /// Completes a run whose last round is acknowledged by every remaining participant.
    pub async fn complete_run(
        &self,
        run_id: RunId,
        initiator: SiteId,
    ) -> CoordinationResult<RunView> {
        let mut run = self.runs.lock(run_id).await?;
        run.ensure_coordinator(initiator, "complete")?;

        let now = Utc::now();
        let departed = self.departed(&run).await;
        let mut next = run.clone();
        next.complete(&departed, now)?;
        let commands = self.prepare_broadcast(
            &run,
            RunCommand::Complete {
                run_id,
                round: run.round,
            },
        )?;
        *run = next;
        self.deliver_all(commands, now).await;

        info!(run_id = %run_id, "run completed");
        Ok(self.view(&run).await)
    }

    /// Stops a run on behalf of its coordinator.
    pub async fn stop_run(
        &self,
        run_id: RunId,
        initiator: SiteId,
        reason: &str,
    ) -> CoordinationResult<RunView> {
        let mut run = self.runs.lock(run_id).await?;
        run.ensure_coordinator(initiator, "stop")?;
        self.close_run(&mut run, RunState::Stopped, reason).await?;
        Ok(self.view(&run).await)
    }

    /// Fails a run. This is the primitive of policies that give up on a run, and needs no
    /// initiator.
    pub async fn fail_run(&self, run_id: RunId, reason: &str) -> CoordinationResult<RunView> {
        let mut run = self.runs.lock(run_id).await?;
        self.close_run(&mut run, RunState::Failed, reason).await?;
        Ok(self.view(&run).await)
    }

    pub async fn get_run(&self, run_id: RunId) -> CoordinationResult<RunView> {
        let run = self.runs.run(run_id).await?;
        Ok(self.view(&run).await)
    }

    /// Returns every run of a project, oldest first.
    pub async fn list_runs(&self, project_id: ProjectId) -> CoordinationResult<Vec<RunView>> {
        let project = self.catalog.project(project_id).await?;
        let mut views = Vec::with_capacity(project.runs.len());
        for run in self.runs.runs(&project.runs).await {
            views.push(self.view(&run).await);
        }
        Ok(views)
    }

    // relay

    /// Sends the result of a participant for a round to the coordinator of the run, and records
    /// the participant as having acknowledged the round. Either both happen or neither does.
    pub async fn submit_result(
        &self,
        run_id: RunId,
        round: u32,
        sender: SiteId,
        payload: Bytes,
    ) -> CoordinationResult<EnvelopeId> {
        let coordinator = self.runs.run(run_id).await?.coordinator;
        self.send_message(Outgoing {
            run_id,
            round,
            sender,
            recipient: coordinator,
            kind: EnvelopeKind::Result,
            payload,
        })
        .await
    }

    /// Relays a message between the coordinator and a participant of a run.
    ///
    /// A RESULT also acknowledges its round on behalf of the sender, exactly like
    /// [`submit_result`](Self::submit_result).
    pub async fn send_message(&self, message: Outgoing) -> CoordinationResult<EnvelopeId> {
        let (run_id, round, sender, kind) =
            (message.run_id, message.round, message.sender, message.kind);
        let mut run = self.runs.lock(run_id).await?;
        let prepared = self.relay.prepare(&run, message)?;
        if kind == EnvelopeKind::Result {
            let mut next = run.clone();
            let first = next.record_round_result(sender, round)?;
            *run = next;
            if first {
                info!(run_id = %run_id, round, participant = %sender, "round result recorded");
            }
        }
        Ok(self.relay.deliver(prepared, Utc::now()).await)
    }

    /// Returns the envelopes addressed to a site after the cursor `since`, optionally restricted
    /// to one run. Polling counts as activity of the site.
    ///
    /// # Errors
    /// Fails with unknown site if the site is unknown or deregistered.
    pub async fn poll_inbox(
        &self,
        site: SiteId,
        since: EnvelopeId,
        run: Option<RunId>,
    ) -> CoordinationResult<Vec<Envelope>> {
        self.registry.touch(site).await?;
        Ok(self.relay.poll(site, since, run).await)
    }

    // maintenance

    /// Marks the sites not seen for longer than `staleness` as unreachable, and purges the
    /// envelopes of the runs that ended longer than `retention` ago.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
        retention: Duration,
    ) -> SweepReport {
        let unreachable = self.registry.sweep_stale(now, staleness).await;
        for site in &unreachable {
            warn!(site_id = %site, "site marked unreachable by sweep");
        }
        let purged_runs = self.runs.retire_ended_before(now - retention).await;
        let mut purged_envelopes = 0;
        for run in &purged_runs {
            let purged = self.relay.purge_run(*run).await;
            debug!(run_id = %run, envelopes = purged, "run purged from mailboxes");
            purged_envelopes += purged;
        }
        SweepReport {
            unreachable,
            purged_runs,
            purged_envelopes,
        }
    }

    async fn close_run(
        &self,
        run: &mut Run,
        state: RunState,
        reason: &str,
    ) -> CoordinationResult<()> {
        let now = Utc::now();
        let mut next = run.clone();
        let command = match state {
            RunState::Failed => {
                next.fail(reason, now)?;
                RunCommand::Fail {
                    run_id: run.id,
                    round: run.round,
                    reason: reason.to_string(),
                }
            }
            _ => {
                next.stop(reason, now)?;
                RunCommand::Stop {
                    run_id: run.id,
                    round: run.round,
                    reason: reason.to_string(),
                }
            }
        };
        // participants of a run that never started have nothing to close
        let commands = if run.state == RunState::Active {
            self.prepare_broadcast(run, command)?
        } else {
            Vec::new()
        };
        *run = next;
        self.deliver_all(commands, now).await;

        info!(run_id = %run.id, state = ?run.state, reason, "run closed");
        Ok(())
    }

    /// Prepares a router-authored command from the coordinator of `run` to each participant.
    fn prepare_broadcast(
        &self,
        run: &Run,
        command: RunCommand,
    ) -> CoordinationResult<Vec<PreparedEnvelope>> {
        let payload = command.encode()?;
        run.participants
            .iter()
            .map(|participant| {
                self.relay.prepare(
                    run,
                    Outgoing {
                        run_id: run.id,
                        round: run.round,
                        sender: run.coordinator,
                        recipient: *participant,
                        kind: EnvelopeKind::Command,
                        payload: payload.clone(),
                    },
                )
            })
            .collect()
    }

    async fn deliver_all(&self, prepared: Vec<PreparedEnvelope>, now: DateTime<Utc>) {
        for envelope in prepared {
            self.relay.deliver(envelope, now).await;
        }
    }

    async fn ensure_no_pending_run(
        &self,
        project: &Project,
        action: &str,
    ) -> CoordinationResult<()> {
        match self.runs.pending_run(&project.runs).await {
            Some(run) => Err(CoordinationError::conflict(format!(
                "cannot {} project {} while run {} is {:?}",
                action, project.id, run.id, run.state
            ))),
            None => Ok(()),
        }
    }

    /// The participants of a run that deregistered since the run was created.
    async fn departed(&self, run: &Run) -> BTreeSet<SiteId> {
        let mut departed = BTreeSet::new();
        for participant in run.participants.iter().copied() {
            match self.registry.status(participant).await {
                Some(SiteStatus::Active) | Some(SiteStatus::Unreachable) => {}
                _ => {
                    departed.insert(participant);
                }
            }
        }
        departed
    }

    async fn view(&self, run: &Run) -> RunView {
        RunView::new(run, &self.departed(run).await)
    }
}
