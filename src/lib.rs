//! # Starfish Router: coordination and relay for cross-site federated learning
//!
//! Sites that must never share raw data train models locally and exchange model updates through
//! the Router. The Router holds no training data. It tracks which sites exist and whether they are
//! alive, which projects they coordinate or take part in, and how far each run of a project has
//! progressed. It relays opaque, possibly end-to-end encrypted, payloads between the coordinator
//! of a run and its participants.
//!
//! ## Components
//!
//! - [`registry`]: registered sites and their liveness.
//! - [`catalog`]: projects, their members and their ordered tasks.
//! - [`state_machine`]: the lifecycle of a run, round by round.
//! - [`relay`]: per-site mailboxes drained by polling with a cursor.
//! - [`services`]: the coordination service composing the above, and the periodic sweeper.
//! - [`rest`]: the HTTP+JSON boundary.
//!
//! Sites only ever poll: the Router never opens a connection to a site, and nothing inside the
//! Router waits for one.

#[macro_use]
extern crate serde;

pub mod catalog;
pub mod common;
pub mod error;
pub mod registry;
pub mod relay;
pub mod rest;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod storage;
