//! The function-evaluator contract consumed by the gradient kernel.
//!
//! Purpose
//! -------
//! Define the seam between the gradient pipeline and whatever objective is
//! being minimized. The derivator and the task manager only ever see this
//! trait; concrete likelihoods live behind it.
//!
//! Conventions
//! -----------
//! - `value` is a pure function of `x`: no global mutable state, safe to
//!   call from any process after a fork. Worker processes rely on this.
//! - `carry` is the Kahan companion of the last `value` call, for callers
//!   that propagate compensated sums across partitions; evaluators without
//!   compensation return `0.0`.
use ndarray::{Array1, Array2};

use crate::likelihood::errors::{LikError, LikResult};

/// Objective function evaluated by the gradient kernel.
///
/// Implementations must be pure in `x` (see module notes on fork safety).
pub trait Evaluator {
    /// Number of parameters the evaluator expects.
    fn dim(&self) -> usize;

    /// Evaluate the objective at `x` (`x.len() == self.dim()`).
    fn value(&self, x: &[f64]) -> f64;

    /// Kahan carry of the last evaluation, when the implementation
    /// accumulates with compensation.
    fn carry(&self) -> f64 {
        0.0
    }
}

/// Quadratic objective `f(x) = xᵀAx + b·x + c`.
///
/// The standard test function of the pipeline: its gradient `2Ax + b` and
/// curvature `2·diag(A)` are known in closed form.
#[derive(Debug, Clone)]
pub struct Quadratic {
    a: Array2<f64>,
    b: Array1<f64>,
    c: f64,
}

impl Quadratic {
    /// Build the form, checking that `a` is square and matches `b`.
    ///
    /// # Errors
    /// - [`LikError::QuadraticShapeMismatch`] on any shape disagreement.
    pub fn new(a: Array2<f64>, b: Array1<f64>, c: f64) -> LikResult<Self> {
        let (rows, cols) = a.dim();
        if rows != cols || rows != b.len() {
            return Err(LikError::QuadraticShapeMismatch { rows, cols, linear: b.len() });
        }
        Ok(Quadratic { a, b, c })
    }

    /// Analytic gradient `2Ax + b`, for test assertions.
    pub fn analytic_gradient(&self, x: &[f64]) -> Array1<f64> {
        let x = Array1::from(x.to_vec());
        2.0 * self.a.dot(&x) + &self.b
    }
}

impl Evaluator for Quadratic {
    fn dim(&self) -> usize {
        self.b.len()
    }

    fn value(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim());
        let x = ndarray::ArrayView1::from(x);
        x.dot(&self.a.dot(&x)) + self.b.dot(&x) + self.c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    // Purpose
    // -------
    // Verify the quadratic evaluator against hand-computed values and its
    // own analytic gradient.
    //
    // Given
    // -----
    // - f(x) = (x0−1)² + 4(x1+2)² written as xᵀAx + b·x + c with
    //   A = diag(1, 4), b = (−2, 16), c = 17.
    //
    // Expect
    // ------
    // - f(0, 0) = 17 and analytic_gradient(0, 0) = (−2, 16).
    fn quadratic_matches_hand_expansion() {
        let f = Quadratic::new(array![[1.0, 0.0], [0.0, 4.0]], array![-2.0, 16.0], 17.0)
            .expect("square shapes should construct");
        assert_eq!(f.value(&[0.0, 0.0]), 17.0);
        let g = f.analytic_gradient(&[0.0, 0.0]);
        assert_eq!(g, array![-2.0, 16.0]);
    }

    #[test]
    // Purpose
    // -------
    // Ensure mismatched shapes are rejected at construction.
    //
    // Given
    // -----
    // - A 2x2 matrix with a 3-element linear term.
    //
    // Expect
    // ------
    // - LikError::QuadraticShapeMismatch.
    fn quadratic_rejects_shape_mismatch() {
        let err = Quadratic::new(
            array![[1.0, 0.0], [0.0, 1.0]],
            array![0.0, 0.0, 0.0],
            0.0,
        )
        .expect_err("shape mismatch must fail");
        match err {
            LikError::QuadraticShapeMismatch { .. } => {}
            other => panic!("Expected QuadraticShapeMismatch, got {other:?}"),
        }
    }
}
