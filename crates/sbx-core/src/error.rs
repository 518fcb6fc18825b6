use serde::{Deserialize, Serialize};

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Which quota cap an admission check tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    ExecRate,
    ConcurrentExec,
    Memory,
    Storage,
    Egress,
    Cpu,
}

impl QuotaKind {
    /// Stable label value for metrics and API bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecRate => "exec_rate",
            Self::ConcurrentExec => "concurrent_exec",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Egress => "egress",
            Self::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for the control plane.
///
/// Every externally surfaced failure is one of these kinds. The
/// transient-vs-fatal distinction lives in the variant, never in message
/// strings; `retry::retry` only re-attempts `Transient`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sandbox, snapshot, or path does not exist or does not belong to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed id, port out of range, disallowed path, unsupported operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sandbox is in the wrong state for the operation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A per-sandbox hard cap rejected the operation.
    #[error("quota exceeded: {kind}")]
    QuotaExceeded { kind: QuotaKind },

    /// Exec, proxy dial, or external I/O exceeded its budget.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Network hiccup against storage or a driver; eligible for retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Invariant violated; the caller should abandon the sandbox.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The preview proxy cannot reach the in-sandbox server.
    #[error("upstream unreachable: {0}")]
    Upstream(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a retry against the same target may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable kind token used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::TimedOut(_) => "timed_out",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::Upstream(_) => "upstream",
        }
    }

    /// Collapse a persistently failing transient error into a fatal one.
    /// Used after internal retries are exhausted.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Transient(msg) => Self::Fatal(msg),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::TimedOut(e.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted => Self::Transient(e.to_string()),
            _ => Self::Fatal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Fatal(format!("json: {}", e))
    }
}
