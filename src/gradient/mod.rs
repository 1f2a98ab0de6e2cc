//! gradient — the numerical gradient kernel and its distributed binding.
//!
//! Purpose
//! -------
//! Compute Minuit-compatible `(grad, g2, gstep)` triples by adaptive
//! central differencing ([`derivator`]), configured by a validated
//! strategy ([`strategy`]), and distribute the per-parameter refinements
//! across worker processes through the task manager ([`job`]).
//!
//! Conventions
//! -----------
//! - Points handed to the kernel are in internal coordinates; the
//!   objective is evaluated at externally transformed points when exact
//!   Minuit mimicry is enabled.
//! - Parameters, gradients, and steps are `ndarray`-based vectors
//!   ([`Theta`], [`Grad`]); any structure on top of them belongs to the
//!   caller.
//! - All fallible entrypoints return [`errors::GradResult`]; the per-cycle
//!   refinement itself cannot fail.

pub mod derivator;
pub mod errors;
pub mod job;
pub mod strategy;

use ndarray::Array1;

/// Parameter vector in internal coordinates.
pub type Theta = Array1<f64>;
/// Gradient vector over the same components.
pub type Grad = Array1<f64>;

pub use derivator::NumericalDerivator;
pub use errors::{GradError, GradResult};
pub use job::{GradientJob, MinimizerOptions};
pub use strategy::GradientStrategy;
