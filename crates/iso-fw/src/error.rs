use thiserror::Error;

/// Errors surfaced by the rule engine. Lock contention and vanished
/// namespaces are handled internally; everything here is terminal for the
/// current invocation.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// A rule referenced a wrapped chain that was never declared.
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    /// A rule set arrived for a physical network with no bridge mapping.
    #[error("no bridge mapping for physical network {0:?}")]
    UnmappedNetwork(String),

    /// A backend command exited non-zero. The exit code is kept so callers
    /// can distinguish the xtables resource-problem condition.
    #[error("command `{command}` failed (exit code {code:?}): {stderr}")]
    Exec {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The restore transaction was rejected. `window` carries a numbered
    /// excerpt of the command script around the offending line.
    #[error("failed to apply {binary} rules:\n{window}")]
    Apply {
        binary: String,
        window: String,
        #[source]
        source: Box<FirewallError>,
    },

    /// Debug-mode re-check found residual commands after an apply. This is
    /// a bug in rule generation or diffing, never a transient condition.
    #[error("{binary} rules did not converge after apply:\n{diff}")]
    NotConverged { binary: String, diff: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
