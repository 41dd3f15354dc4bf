use thiserror::Error;

/// Operator-visible guard failures. Everything else a guard encounters
/// (crashes, unexpected exits) is handled by the restart machinery and is
/// deliberately not an error.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A child already exists; stop it before starting or updating options.
    #[error("already running with PID {0}")]
    AlreadyRunning(i32),

    /// No child to stop.
    #[error("not running")]
    NotRunning,

    /// The OS spawn failed.
    #[error("failed to spawn {program:?}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending SIGINT to the child failed.
    #[error("failed to signal PID {pid}: {source}")]
    KillFailed {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    /// The child did not exit within the kill timeout after SIGINT.
    #[error("timeout waiting for PID {0} to exit")]
    KillTimeout(i32),

    /// The guard event loop is not running (channel closed).
    #[error("guard event loop is gone")]
    LoopGone,
}
