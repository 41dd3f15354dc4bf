use std::path::PathBuf;

use tokio::sync::oneshot;
use tracing::{error, info};

use crate::stats::StatsDescriptor;

/// Fleet-level operator commands. Each variant carries a private single-use
/// reply channel; the controller command loop is the only consumer.
#[derive(Debug)]
pub enum Command {
    StartAll {
        reply: oneshot::Sender<CommandResponse>,
    },
    StopAll {
        reply: oneshot::Sender<CommandResponse>,
    },
    Start {
        unit: String,
        reply: oneshot::Sender<CommandResponse>,
    },
    Stop {
        unit: String,
        reply: oneshot::Sender<CommandResponse>,
    },
    Enable {
        unit: String,
        reply: oneshot::Sender<CommandResponse>,
    },
    Disable {
        unit: String,
        reply: oneshot::Sender<CommandResponse>,
    },
    Deploy {
        unit: String,
        staging_dir: PathBuf,
        reply: oneshot::Sender<CommandResponse>,
    },
}

/// Outcome of one command: informational messages, errors, and optionally the
/// stats snapshots a stat query produced. Merging concatenates in order.
#[derive(Debug, Default)]
pub struct CommandResponse {
    pub messages: Vec<String>,
    pub errors: Vec<anyhow::Error>,
    pub data: Vec<StatsDescriptor>,
}

impl CommandResponse {
    pub fn add_msg(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
    }

    pub fn add_error(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Folds all errors into a single one; `None` when the command succeeded.
    pub fn error(&self) -> Option<anyhow::Error> {
        if self.errors.is_empty() {
            return None;
        }
        Some(anyhow::anyhow!(self.error_strings().join("\n")))
    }

    pub fn error_strings(&self) -> Vec<String> {
        self.errors.iter().map(|e| format!("{e:#}")).collect()
    }

    pub fn merge(&mut self, other: CommandResponse) {
        self.messages.extend(other.messages);
        self.errors.extend(other.errors);
        self.data.extend(other.data);
    }

    pub fn log(&self) {
        for m in &self.messages {
            info!("controller: {m}");
        }
        for e in &self.errors {
            error!("controller: {e:#}");
        }
    }
}
