use chrono::{DateTime, Utc};

use super::envelope::{Envelope, Outgoing};
use crate::common::{EnvelopeId, RunId};

/// The append-only log of the envelopes addressed to one site.
///
/// Envelope ids are assigned on append, strictly increasing and without gaps. Purging the
/// envelopes of a run removes them from the log but never rewinds the id counter.
#[derive(Debug, Default)]
pub struct Mailbox {
    envelopes: Vec<Envelope>,
    last_id: EnvelopeId,
}

impl Mailbox {
    pub fn append(&mut self, message: Outgoing, now: DateTime<Utc>) -> EnvelopeId {
        let id = self.last_id.next();
        self.last_id = id;
        self.envelopes.push(Envelope::new(id, message, now));
        id
    }

    /// Returns every envelope after `since`, in id order, optionally restricted to one run, and
    /// marks them delivered.
    ///
    /// Delivery does not hide an envelope from later polls: the cursor alone decides what is
    /// returned, so polling again from the same cursor replays the same envelopes.
    pub fn poll(&mut self, since: EnvelopeId, run: Option<RunId>) -> Vec<Envelope> {
        // envelopes are sorted by id, so everything after `since` is a suffix
        let start = self.envelopes.partition_point(|envelope| envelope.id <= since);
        self.envelopes[start..]
            .iter_mut()
            .filter(|envelope| run.map_or(true, |run| envelope.run_id == run))
            .map(|envelope| {
                envelope.delivered = true;
                envelope.clone()
            })
            .collect()
    }

    /// Removes the envelopes of a run and returns how many there were.
    pub fn purge_run(&mut self, run: RunId) -> usize {
        let before = self.envelopes.len();
        self.envelopes.retain(|envelope| envelope.run_id != run);
        before - self.envelopes.len()
    }

    #[cfg(test)]
    pub fn last_id(&self) -> EnvelopeId {
        self.last_id
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}
