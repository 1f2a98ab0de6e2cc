//! parfit — parallel gradient pipeline for maximum-likelihood fitting.
//!
//! Purpose
//! -------
//! Extend a statistical fitting stack with a distributed numerical
//! gradient: a Minuit-compatible adaptive central-difference kernel whose
//! per-parameter refinements are fanned out over a fork-based
//! master/queue/worker process topology.
//!
//! Key behaviors
//! -------------
//! - `params` owns the parameter-space layer: validated per-parameter
//!   settings, internal/external transforms for limited parameters, and
//!   the machine-precision constants that bound step sizes.
//! - `gradient` owns the numerical kernel: iterative step refinement per
//!   parameter, initial-gradient seeding, and the `GradientJob` that binds
//!   the kernel to the task manager (one task = one partial derivative).
//! - `likelihood` defines the objective contract (`Evaluator`) plus
//!   reference evaluators: a quadratic test function and a binned Poisson
//!   template likelihood with Kahan-compensated, partitionable sums.
//! - `multiprocess` owns the process topology: poll-capable
//!   shared-memory/socketpair pipes, the message alphabets, the job
//!   registry, and the queue and worker loops.
//!
//! Invariants & assumptions
//! ------------------------
//! - Concurrency is multi-process only; every process is single-threaded
//!   and synchronizes exclusively through the pipe transport.
//! - Jobs register with the task manager before its first activation
//!   (i.e. before any fork), so every process holds an identical registry
//!   replica.
//! - Objective evaluators are pure in their argument and safe to call
//!   from any process after the fork.
//!
//! Downstream usage
//! ----------------
//! - A gradient-based minimizer drives `GradientJob`: synchronize the
//!   parameter settings and strategy, call `calculate(x)` per iteration,
//!   and drain the `(grad, g2, gstep)` vectors through the `fill_*`
//!   accessors.
//! - Serial callers use `NumericalDerivator` directly; results are
//!   bitwise identical to the distributed path.

pub mod gradient;
pub mod likelihood;
pub mod multiprocess;
pub mod params;
