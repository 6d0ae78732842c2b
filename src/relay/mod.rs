//! The store-and-forward message relay.
//!
//! Every site has one [`Mailbox`], an append-only log of the envelopes addressed to it, that it
//! drains by polling with a cursor. The relay checks the envelope metadata against the run the
//! envelope belongs to, and never looks at the payload beyond its size.
//!
//! Sending is split in two steps. [`MessageRelay::prepare`] runs every check and cannot mutate
//! anything, [`MessageRelay::deliver`] appends and cannot fail. The coordination service relies
//! on this to make an operation that both sends an envelope and moves a run either do both or
//! neither.

pub mod envelope;
pub mod mailbox;

use chrono::{DateTime, Utc};
use tracing::debug;

pub use self::{
    envelope::{Envelope, EnvelopeKind, Outgoing},
    mailbox::Mailbox,
};
use crate::{
    common::{EnvelopeId, RunId, SiteId},
    error::{CoordinationError, CoordinationResult},
    state_machine::{Role, Run},
    storage::Table,
};

/// The default maximum size of a payload, in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A message that passed every check of the relay and is ready to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedEnvelope(Outgoing);

impl PreparedEnvelope {
    pub fn recipient(&self) -> SiteId {
        self.0.recipient
    }
}

/// The relay: one mailbox per recipient site.
#[derive(Debug)]
pub struct MessageRelay {
    mailboxes: Table<SiteId, Mailbox>,
    max_payload_size: usize,
}

impl Default for MessageRelay {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl MessageRelay {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            mailboxes: Table::new(),
            max_payload_size,
        }
    }

    /// Checks a message against `run`, the run it belongs to.
    ///
    /// # Errors
    /// - invalid state if the run is terminal, or the message is for a round the run has not
    ///   reached yet;
    /// - authorization error if the sender has no role in the run, the recipient is not its
    ///   counterpart (participants only talk to the coordinator and the other way round), or the
    ///   sender's role may not send this kind of envelope;
    /// - validation error if the payload is too large or the message does not name `run`.
    pub fn prepare(&self, run: &Run, message: Outgoing) -> CoordinationResult<PreparedEnvelope> {
        if message.run_id != run.id {
            return Err(CoordinationError::validation(format!(
                "message for run {} checked against run {}",
                message.run_id, run.id
            )));
        }
        if run.state.is_terminal() {
            return Err(CoordinationError::invalid_state(format!(
                "run {} is {:?} and relays no more messages",
                run.id, run.state
            )));
        }

        let sender_role = run.role_of(message.sender).ok_or_else(|| {
            CoordinationError::authorization(format!(
                "site {} has no role in run {}",
                message.sender, run.id
            ))
        })?;
        let counterpart = match sender_role {
            Role::Coordinator => run.role_of(message.recipient) == Some(Role::Participant),
            Role::Participant => message.recipient == run.coordinator,
        };
        if !counterpart {
            return Err(CoordinationError::authorization(format!(
                "site {} may not send to site {} in run {}",
                message.sender, message.recipient, run.id
            )));
        }
        let allowed_kind = match message.kind {
            EnvelopeKind::Command => sender_role == Role::Coordinator,
            EnvelopeKind::Result => sender_role == Role::Participant,
            EnvelopeKind::Heartbeat => true,
        };
        if !allowed_kind {
            return Err(CoordinationError::authorization(format!(
                "a {:?} may not send {:?} envelopes",
                sender_role, message.kind
            )));
        }

        if message.round > run.round {
            return Err(CoordinationError::invalid_state(format!(
                "run {} is in round {}, cannot relay a message for round {}",
                run.id, run.round, message.round
            )));
        }
        if message.payload.len() > self.max_payload_size {
            return Err(CoordinationError::validation(format!(
                "payload of {} bytes exceeds the limit of {} bytes",
                message.payload.len(),
                self.max_payload_size
            )));
        }

        Ok(PreparedEnvelope(message))
    }

    /// Appends a prepared message to the mailbox of its recipient.
    pub async fn deliver(&self, prepared: PreparedEnvelope, now: DateTime<Utc>) -> EnvelopeId {
        let PreparedEnvelope(message) = prepared;
        let (recipient, run_id, kind) = (message.recipient, message.run_id, message.kind);
        let id = self
            .mailboxes
            .lock_or_insert_with(recipient, Mailbox::default)
            .await
            .append(message, now);
        debug!(%recipient, %run_id, envelope_id = %id, ?kind, "envelope appended");
        id
    }

    /// Prepares then delivers a message.
    pub async fn send(
        &self,
        run: &Run,
        message: Outgoing,
        now: DateTime<Utc>,
    ) -> CoordinationResult<EnvelopeId> {
        let prepared = self.prepare(run, message)?;
        Ok(self.deliver(prepared, now).await)
    }

    /// Returns the envelopes of `recipient` after the cursor `since`, in id order, optionally
    /// restricted to one run.
    ///
    /// Polling an empty or never used mailbox returns nothing. Whether the recipient is a known
    /// site is up to the caller to check.
    pub async fn poll(
        &self,
        recipient: SiteId,
        since: EnvelopeId,
        run: Option<RunId>,
    ) -> Vec<Envelope> {
        let envelopes = match self.mailboxes.lock(&recipient).await {
            Some(mut mailbox) => mailbox.poll(since, run),
            None => Vec::new(),
        };
        debug!(%recipient, %since, count = envelopes.len(), "mailbox polled");
        envelopes
    }

    /// Removes the envelopes of a run from every mailbox and returns how many there were.
    pub async fn purge_run(&self, run: RunId) -> usize {
        let mut purged = 0;
        for site in self.mailboxes.keys().await {
            if let Some(mut mailbox) = self.mailboxes.lock(&site).await {
                purged += mailbox.purge_run(run);
            }
        }
        purged
    }
}
