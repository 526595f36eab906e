use std::fmt;

/// Errors returned by the sandbox telemetry core.
///
/// Variants follow the error-kind catalogue of the orchestration design:
/// user-input mistakes, missing external collaborators, sandbox-runtime
/// failures, target-process failures, timeouts, and single-tick sampler
/// failures are each distinguishable so callers can decide what is
/// retryable and what should abort a session.
#[derive(Debug)]
pub enum SandboxError {
    /// Missing binary, malformed session, bad CLI input.
    UserInput(String),
    /// A required external collaborator (daemon, queue, scraper) is down.
    EnvironmentUnavailable(String),
    /// Image build or container run/teardown failure.
    SandboxFailure(String),
    /// The target binary exited non-zero.
    TargetFailure(i32),
    /// Soft or hard timeout fired.
    Timeout(String),
    /// Single-tick sampler failure (non-fatal, logged and skipped by caller).
    SamplerFailure(String),
    /// Requested resource not found.
    NotFound(String),
    /// Local persistence failure.
    Storage(String),
    /// HTTP request failure.
    Http(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Docker/container-daemon failure.
    Docker(String),
    /// Durable queue failure.
    Queue(String),
    /// Metrics scraper failure.
    Scraper(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::UserInput(msg) => write!(f, "user input error: {msg}"),
            SandboxError::EnvironmentUnavailable(msg) => {
                write!(f, "environment unavailable: {msg}")
            }
            SandboxError::SandboxFailure(msg) => write!(f, "sandbox failure: {msg}"),
            SandboxError::TargetFailure(code) => write!(f, "target exited with code {code}"),
            SandboxError::Timeout(msg) => write!(f, "timeout: {msg}"),
            SandboxError::SamplerFailure(msg) => write!(f, "sampler failure: {msg}"),
            SandboxError::NotFound(msg) => write!(f, "not found: {msg}"),
            SandboxError::Storage(msg) => write!(f, "storage error: {msg}"),
            SandboxError::Http(msg) => write!(f, "http error: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::Docker(msg) => write!(f, "docker error: {msg}"),
            SandboxError::Queue(msg) => write!(f, "queue error: {msg}"),
            SandboxError::Scraper(msg) => write!(f, "scraper error: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<SandboxError> for String {
    fn from(err: SandboxError) -> Self {
        err.to_string()
    }
}

/// Which of the three CLI exit codes an error maps to (spec §6).
impl SandboxError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SandboxError::UserInput(_) | SandboxError::NotFound(_) | SandboxError::Validation(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
