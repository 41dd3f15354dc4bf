//! Wire protocol of the `copr-dummy` test child, shared by the binary and the
//! integration tests.

use serde::{Deserialize, Serialize};

pub const ACTION_PROBE: &str = "probe";
pub const ACTION_CRASH: &str = "crash";
pub const ACTION_STRESS: &str = "stress";
pub const ACTION_GETENV: &str = "getenv";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DummyCommand {
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Param", default)]
    pub param: String,
}

impl DummyCommand {
    pub fn probe() -> Self {
        Self {
            action: ACTION_PROBE.to_string(),
            param: String::new(),
        }
    }

    pub fn crash() -> Self {
        Self {
            action: ACTION_CRASH.to_string(),
            param: String::new(),
        }
    }

    pub fn stress() -> Self {
        Self {
            action: ACTION_STRESS.to_string(),
            param: String::new(),
        }
    }

    pub fn getenv(key: &str) -> Self {
        Self {
            action: ACTION_GETENV.to_string(),
            param: key.to_string(),
        }
    }
}
