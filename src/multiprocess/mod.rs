//! multiprocess — fork-based task distribution over shared-memory pipes.
//!
//! Purpose
//! -------
//! Provide the process-level concurrency of the gradient pipeline: a
//! master/queue/worker topology forked from the initial process, a FIFO
//! task queue with worker-driven work stealing, result aggregation, and
//! lifecycle control. Concurrency here is multi-process only; every
//! process is single-threaded and blocks solely in `poll`, framed reads,
//! or a flush against a full ring.
//!
//! Key behaviors
//! -------------
//! - [`pipe`]: bidirectional poll-capable channels (shared-memory ring or
//!   socketpair) with framed typed messages and explicit flush.
//! - [`messages`]: the four directed tag alphabets of the protocol.
//! - [`job`]: the capability contract a parallelizable computation
//!   implements; jobs register before activation and are addressed by id.
//! - [`manager`]: topology construction, the queue and worker loops, and
//!   the master-facing enqueue/retrieve/update/terminate operations.
//!
//! Conventions
//! -----------
//! - Per-pipe FIFO ordering only; handshakes establish any cross-pipe
//!   order a protocol needs.
//! - Fatal protocol and lifecycle errors abort the affected process;
//!   shutdown-path failures are logged and swallowed so teardown never
//!   panics.

pub mod errors;
pub mod job;
pub mod manager;
pub mod messages;
pub mod pipe;

pub use errors::{MpError, MpResult};
pub use job::Job;
pub use manager::{Role, TaskManager, TopologyConfig};
pub use messages::{JobTask, M2Q, Q2M, Q2W, W2Q};
pub use pipe::{poll_pipes, PipeEnd, PollEntry, Transport};
