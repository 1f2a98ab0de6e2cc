//! multiprocess::job — the contract a parallelizable computation implements.
//!
//! Purpose
//! -------
//! Define the capability set the task manager drives: how to compute one
//! task, how to serialize its result off a worker, how to store it on the
//! queue, and how to drain the aggregate back onto the master. A job
//! registers with the manager at construction and is addressed by its
//! `job_id` in every protocol message.
//!
//! Key behaviors
//! -------------
//! - Computation and serialization are split: `evaluate_task` produces the
//!   result in job state, `task_result_bytes` encodes it, and the
//!   queue/master receivers decode it. The transport owns all framing and
//!   hands jobs opaque byte slices.
//! - State updates (`update_real`) and scalar remote calls
//!   (`call_double_const_method`) flow through the same trait so the worker
//!   loop can dispatch every message kind to the addressed job.
//!
//! Conventions
//! -----------
//! - Methods take `&self`; jobs use interior mutability. Each process has
//!   its own replica of every job after the fork, so no cross-process
//!   sharing exists.
//! - A job must be registered before the manager's first activation; the
//!   registry replica is then identical in every process and `job_id`
//!   lookups agree everywhere.
use crate::multiprocess::errors::{MpError, MpResult};

/// Capability set of a parallelizable computation.
///
/// The method names track the protocol stations: worker (`evaluate_task`,
/// `task_result_bytes`), queue (`receive_task_result_on_queue`,
/// `queue_results_bytes`, `clear_results`), master
/// (`receive_results_on_master`). `update_real` and
/// `call_double_const_method` serve the broadcast and relay messages.
pub trait Job {
    /// Compute one task on a worker. The result stays in job state until
    /// [`Job::task_result_bytes`] serializes it.
    ///
    /// # Errors
    /// - [`MpError::TaskFailed`] aborts the worker process.
    fn evaluate_task(&self, task: usize) -> MpResult<()>;

    /// Serialize the result of `task` for the wire.
    fn task_result_bytes(&self, task: usize) -> Vec<u8>;

    /// Store one worker's result on the queue process.
    ///
    /// # Errors
    /// - [`MpError::ResultSize`] when the payload does not decode.
    fn receive_task_result_on_queue(
        &self, task: usize, worker_id: usize, bytes: &[u8],
    ) -> MpResult<()>;

    /// Serialize all stored task results for the retrieve drain.
    fn queue_results_bytes(&self) -> Vec<u8>;

    /// Merge a retrieve drain back into master-side state.
    ///
    /// # Errors
    /// - [`MpError::ResultSize`] when the payload does not decode.
    fn receive_results_on_master(&self, bytes: &[u8]) -> MpResult<()>;

    /// Forget stored results after a drain.
    fn clear_results(&self);

    /// Apply a broadcast state update: coordinate `ix` takes `val`;
    /// `is_const` toggles the parameter's constness.
    fn update_real(&self, ix: usize, val: f64, is_const: bool);

    /// Evaluate a named scalar method on a worker replica.
    ///
    /// # Errors
    /// - [`MpError::UnsupportedMethod`] unless the job overrides this.
    fn call_double_const_method(&self, key: &str) -> MpResult<f64> {
        Err(MpError::UnsupportedMethod { key: key.to_string() })
    }
}
