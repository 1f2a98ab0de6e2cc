//! Errors for the multiprocess layer (transport, protocol, lifecycle).
//!
//! The taxonomy follows the process model's failure policy:
//! - **Protocol** errors (unexpected tag, framing mismatch, handshake
//!   violation) are fatal to the affected process; child processes log and
//!   `_exit` with a nonzero code, the master surfaces them as `Err`.
//! - **Lifecycle** errors (job registered after activation, double
//!   activation, missing instance) are reported immediately and are not
//!   recoverable.
//! - Platform limitations (CPU affinity) and shutdown-path failures are
//!   *not* errors: they are logged as warnings and execution continues, so
//!   the teardown path never panics.

/// Result alias for multiprocess operations.
pub type MpResult<T> = Result<T, MpError>;

/// Unified error type for the pipe transport and the task manager.
#[derive(Debug, Clone, PartialEq)]
pub enum MpError {
    // ---- Protocol (fatal) ----
    /// A tag outside the expected alphabet was read; `context` names the
    /// alphabet, `tag` the offending value.
    Protocol { context: &'static str, tag: u32 },

    /// A handshake did not return the expected message.
    Handshake { expected: &'static str, tag: u32 },

    /// A result payload had the wrong size for its job.
    ResultSize { job_id: usize, expected: usize, actual: usize },

    /// A message referenced a job id absent from this process's registry.
    JobMissing { job_id: usize },

    // ---- Lifecycle (fatal) ----
    /// Jobs must be registered before the first activation forks the
    /// topology.
    AlreadyActivated,

    /// At most one task manager exists at any moment; the previous one is
    /// still alive.
    InstanceAlive,

    /// `TaskManager::current()` called without a live instance.
    NoInstance,

    /// The operation is only valid on a specific process role.
    WrongRole { op: &'static str },

    /// Worker count must be nonzero.
    NoWorkers,

    // ---- Task evaluation ----
    /// A job's task evaluation failed on a worker.
    TaskFailed { task: usize, message: String },

    // ---- Transport ----
    /// An OS-level pipe operation failed; `errno` is the raw error code.
    Io { context: &'static str, errno: i32 },

    /// The peer closed its end of the pipe.
    PeerClosed { context: &'static str },

    /// A frame larger than the ring capacity was submitted.
    FrameTooLarge { len: usize, capacity: usize },

    // ---- Job-level ----
    /// `call_double_const_method` key not supported by the addressed job.
    UnsupportedMethod { key: String },
}

impl MpError {
    /// Wrap the current `errno` with a static context string.
    pub(crate) fn last_os(context: &'static str) -> Self {
        MpError::Io { context, errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0) }
    }
}

impl std::error::Error for MpError {}

impl std::fmt::Display for MpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MpError::Protocol { context, tag } => {
                write!(f, "Protocol violation in {context}: unexpected tag {tag:#x}.")
            }
            MpError::Handshake { expected, tag } => {
                write!(f, "Handshake violation: expected {expected}, got tag {tag:#x}.")
            }
            MpError::ResultSize { job_id, expected, actual } => {
                write!(
                    f,
                    "Result payload for job {job_id} has {actual} bytes, expected {expected}."
                )
            }
            MpError::JobMissing { job_id } => {
                write!(f, "Job {job_id} is not registered in this process.")
            }
            MpError::AlreadyActivated => {
                write!(
                    f,
                    "Task manager is already activated (forking has taken place); register all jobs before the first activation."
                )
            }
            MpError::InstanceAlive => {
                write!(
                    f,
                    "A task manager instance is still alive; tear it down before creating another."
                )
            }
            MpError::NoInstance => {
                write!(f, "No task manager instance exists; construct one first.")
            }
            MpError::WrongRole { op } => {
                write!(f, "Operation '{op}' invoked on the wrong process role.")
            }
            MpError::NoWorkers => write!(f, "Topology needs at least one worker process."),
            MpError::TaskFailed { task, message } => {
                write!(f, "Task {task} failed on its worker: {message}")
            }
            MpError::Io { context, errno } => {
                write!(f, "Pipe I/O failure in {context}: errno {errno}.")
            }
            MpError::PeerClosed { context } => {
                write!(f, "Peer closed the pipe during {context}.")
            }
            MpError::FrameTooLarge { len, capacity } => {
                write!(f, "Frame of {len} bytes exceeds the ring capacity of {capacity}.")
            }
            MpError::UnsupportedMethod { key } => {
                write!(f, "Job does not support const method key '{key}'.")
            }
        }
    }
}
