//! Identifiers shared by all the coordination components.

use std::{fmt, str::FromStr};

use derive_more::{Display, From, Into};
use uuid::Uuid;

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Return a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

random_id!(
    /// A unique random site identifier, assigned at registration.
    SiteId
);

random_id!(
    /// A unique random project identifier.
    ProjectId
);

random_id!(
    /// A unique random run identifier.
    RunId
);

/// The identifier of an envelope within the mailbox of one recipient.
///
/// Ids start at `1`, so that `0` can be used as the cursor that
/// precedes every envelope of a mailbox.
#[derive(
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Copy,
    Clone,
    Default,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct EnvelopeId(u64);

impl EnvelopeId {
    /// The cursor that precedes every envelope.
    pub const ORIGIN: EnvelopeId = EnvelopeId(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
