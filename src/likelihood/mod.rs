//! likelihood — the objective-function contract and reference evaluators.
//!
//! Purpose
//! -------
//! Define the seam between the gradient pipeline and the objective being
//! minimized ([`evaluator::Evaluator`]), and ship two concrete evaluators:
//! a quadratic test function with closed-form derivatives and a binned
//! Poisson template likelihood with Kahan-compensated, partitionable
//! accumulation.
//!
//! Conventions
//! -----------
//! - Evaluators are pure in `x` and fork-safe; worker processes call them
//!   after the topology fork without synchronization.
//! - Compensated sums expose their carry so partitioned evaluation can
//!   merge partials without losing low-order bits.

pub mod binned;
pub mod errors;
pub mod evaluator;
pub mod kahan;

pub use binned::BinnedNll;
pub use errors::{LikError, LikResult};
pub use evaluator::{Evaluator, Quadratic};
pub use kahan::KahanSum;
