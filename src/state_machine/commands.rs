//! The commands the Router relays to participants on behalf of the run lifecycle.

use bytes::Bytes;

use crate::{
    catalog::TaskSpec,
    common::RunId,
    error::{CoordinationError, CoordinationResult},
};

/// A command broadcast as a COMMAND envelope from a run's coordinator to its participants.
///
/// This is the only payload the Router ever authors. It is encoded to JSON once, and from then
/// on travels through the relay as opaque bytes like any other payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunCommand {
    /// Execute `task` for `round`.
    Start {
        run_id: RunId,
        round: u32,
        task: TaskSpec,
    },
    /// The coordinator stopped the run.
    Stop {
        run_id: RunId,
        round: u32,
        reason: String,
    },
    /// The run failed.
    Fail {
        run_id: RunId,
        round: u32,
        reason: String,
    },
    /// The run completed.
    Complete { run_id: RunId, round: u32 },
}

impl RunCommand {
    pub fn encode(&self) -> CoordinationResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| CoordinationError::validation(format!("unencodable command: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::catalog::tasks::tests::task;

    #[test]
    fn test_encode_start() {
        let run_id = RunId::new();
        let bytes = RunCommand::Start {
            run_id,
            round: 1,
            task: task(1),
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["action"], "start");
        assert_eq!(value["run_id"], json!(run_id.to_string()));
        assert_eq!(value["round"], 1);
        assert_eq!(value["task"]["model"], "LogisticRegression");
    }

    #[test]
    fn test_encode_stop() {
        let bytes = RunCommand::Stop {
            run_id: RunId::new(),
            round: 3,
            reason: "participant lost".to_string(),
        }
        .encode()
        .unwrap();
        let command: RunCommand = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(command, RunCommand::Stop { round: 3, .. }));
    }
}
