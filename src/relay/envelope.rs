use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::common::{EnvelopeId, RunId, SiteId};

/// The relay-visible tag of an envelope. It never says anything about the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// From the coordinator to a participant.
    Command,
    /// From a participant to the coordinator.
    Result,
    /// Either way.
    Heartbeat,
}

/// A message on its way to a mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub run_id: RunId,
    pub round: u32,
    pub sender: SiteId,
    pub recipient: SiteId,
    pub kind: EnvelopeKind,
    pub payload: Bytes,
}

/// A message stored in the mailbox of its recipient.
///
/// The payload is opaque: it may well be encrypted end-to-end between the sender and the
/// recipient, and it is returned exactly as it was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub run_id: RunId,
    pub round: u32,
    pub sender: SiteId,
    pub recipient: SiteId,
    pub kind: EnvelopeKind,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    /// Whether the envelope was returned by a poll at least once.
    pub delivered: bool,
}

impl Envelope {
    pub(crate) fn new(id: EnvelopeId, message: Outgoing, created_at: DateTime<Utc>) -> Self {
        let Outgoing {
            run_id,
            round,
            sender,
            recipient,
            kind,
            payload,
        } = message;
        Self {
            id,
            run_id,
            round,
            sender,
            recipient,
            kind,
            payload,
            created_at,
            delivered: false,
        }
    }
}
