//! gradient::derivator — Minuit-compatible adaptive central differences.
//!
//! Purpose
//! -------
//! Compute, for each free parameter, the triple `(grad, g2, gstep)`: first
//! derivative, second derivative, and the step size that produced them. The
//! step is refined iteratively per parameter, balancing truncation error
//! (wants small steps) against roundoff in the function value (wants large
//! steps), exactly the way Minuit's gradient calculator does.
//!
//! Key behaviors
//! -------------
//! - [`NumericalDerivator::differentiate`] runs the full ascending sweep;
//!   [`NumericalDerivator::differentiate_component`] refines one parameter
//!   and is the unit of work the task manager distributes.
//! - [`NumericalDerivator::setup`] caches `f(x)` and the derived noise
//!   floor once per point, so a batch of component calls shares one
//!   baseline evaluation.
//! - [`NumericalDerivator::set_initial_gradient`] seeds the state from the
//!   parameter settings' step widths before the first minimization step.
//! - When exact Minuit mimicry is enabled, steps live in internal space,
//!   the objective is evaluated at externally transformed points, and
//!   [`NumericalDerivator::external_gradient`] converts the result through
//!   the transform Jacobian.
//!
//! Invariants & assumptions
//! ------------------------
//! - Per cycle and parameter: the chosen step satisfies
//!   `step ≥ max(8·eps², 8·|eps2·x_i|)` and `step ≤ 10·gstep_prev`; a
//!   limited parameter's step never exceeds 0.5 in internal space.
//! - Failing both convergence tests across all cycles is not an error; the
//!   last cycle's values stand.
//! - The refinement loop allocates nothing and cannot fail; all fallible
//!   checks happen in `setup`/`synchronize_settings`.
//! - Per-parameter refinements are independent given the shared `f(x)`, so
//!   components may run in any order or in different processes.
use ndarray::Array1;

use crate::gradient::{
    errors::{GradError, GradResult},
    strategy::GradientStrategy,
};
use crate::params::{MachinePrecision, ParameterSettings, ParameterTransform};

/// Default per-component state before seeding: `(grad, g2, gstep)`.
const INITIAL_STATE: (f64, f64, f64) = (0.1, 0.1, 0.001);

/// Adaptive central-difference derivator over one parameter vector.
///
/// State is sized by the synchronized [`ParameterSettings`]; the minimizer
/// re-synchronizes settings and strategy between calls. The objective is
/// passed per call as `f: Fn(&[f64]) -> f64` over external coordinates.
pub struct NumericalDerivator {
    strategy: GradientStrategy,
    precision: MachinePrecision,
    mimic_transforms: bool,

    settings: Vec<ParameterSettings>,
    transforms: Vec<ParameterTransform>,

    grad: Array1<f64>,
    g2: Array1<f64>,
    gstep: Array1<f64>,

    // Point caches filled by `setup`.
    int: Vec<f64>,
    ext: Vec<f64>,
    fval: f64,
    dfmin: f64,
    ready: bool,
}

impl NumericalDerivator {
    /// Construct a derivator for the given parameters.
    ///
    /// `mimic_transforms` selects whether limited parameters are walked in
    /// internal space through their transforms; with it off every transform
    /// is the identity and the point is taken as-is.
    pub fn new(
        settings: &[ParameterSettings], strategy: GradientStrategy, mimic_transforms: bool,
    ) -> Self {
        let mut derivator = NumericalDerivator {
            strategy,
            precision: MachinePrecision::new(),
            mimic_transforms,
            settings: Vec::new(),
            transforms: Vec::new(),
            grad: Array1::zeros(0),
            g2: Array1::zeros(0),
            gstep: Array1::zeros(0),
            int: Vec::new(),
            ext: Vec::new(),
            fval: 0.0,
            dfmin: 0.0,
            ready: false,
        };
        derivator.synchronize_settings(settings);
        derivator
    }

    /// Replace the parameter settings, rebuilding transforms and resetting
    /// the state to the pre-seeding defaults when the dimension changes.
    pub fn synchronize_settings(&mut self, settings: &[ParameterSettings]) {
        let dim_changed = settings.len() != self.settings.len();
        self.settings = settings.to_vec();
        self.transforms = self
            .settings
            .iter()
            .map(|s| {
                if self.mimic_transforms {
                    ParameterTransform::for_settings(s)
                } else {
                    ParameterTransform::Unbounded
                }
            })
            .collect();
        if dim_changed {
            let n = self.settings.len();
            self.grad = Array1::from_elem(n, INITIAL_STATE.0);
            self.g2 = Array1::from_elem(n, INITIAL_STATE.1);
            self.gstep = Array1::from_elem(n, INITIAL_STATE.2);
            self.int = vec![0.0; n];
            self.ext = vec![0.0; n];
        }
        self.ready = false;
    }

    /// Replace the strategy (tolerances, cycles, error level).
    pub fn set_strategy(&mut self, strategy: GradientStrategy) {
        self.strategy = strategy;
    }

    /// Toggle one parameter's constness; fixed parameters are skipped by
    /// the refinement loop.
    pub fn set_fixed(&mut self, i: usize, fixed: bool) {
        if let Some(settings) = self.settings.get_mut(i) {
            settings.fixed = fixed;
        }
    }

    pub fn strategy(&self) -> &GradientStrategy {
        &self.strategy
    }

    pub fn precision(&self) -> &MachinePrecision {
        &self.precision
    }

    /// Number of parameters.
    pub fn dim(&self) -> usize {
        self.settings.len()
    }

    /// Overwrite the `(grad, g2, gstep)` state wholesale.
    pub fn set_initial_values(&mut self, grad: &[f64], g2: &[f64], gstep: &[f64]) {
        debug_assert_eq!(grad.len(), self.dim());
        debug_assert_eq!(g2.len(), self.dim());
        debug_assert_eq!(gstep.len(), self.dim());
        self.grad = Array1::from(grad.to_vec());
        self.g2 = Array1::from(g2.to_vec());
        self.gstep = Array1::from(gstep.to_vec());
    }

    /// Set one component's triple; used when merging distributed results.
    pub fn set_component(&mut self, i: usize, grad: f64, g2: f64, gstep: f64) {
        self.grad[i] = grad;
        self.g2[i] = g2;
        self.gstep[i] = gstep;
    }

    pub fn grad(&self) -> &Array1<f64> {
        &self.grad
    }

    pub fn g2(&self) -> &Array1<f64> {
        &self.g2
    }

    pub fn gstep(&self) -> &Array1<f64> {
        &self.gstep
    }

    /// Cached objective value at the last `setup` point.
    pub fn fval(&self) -> f64 {
        self.fval
    }

    /// Cache the point, the baseline `f(x)`, and the derived noise floor.
    ///
    /// `x` is in internal coordinates; the objective is evaluated at the
    /// externally transformed point. Must precede any
    /// [`NumericalDerivator::differentiate_component`] batch for that point.
    ///
    /// # Errors
    /// - [`GradError::DimensionMismatch`] when `x.len()` differs from the
    ///   synchronized parameter count.
    pub fn setup<F: Fn(&[f64]) -> f64>(&mut self, x: &[f64], f: &F) -> GradResult<()> {
        if x.len() != self.dim() {
            return Err(GradError::DimensionMismatch { expected: self.dim(), actual: x.len() });
        }
        self.int.copy_from_slice(x);
        for (i, transform) in self.transforms.iter().enumerate() {
            self.ext[i] = transform.int2ext(self.int[i]);
        }
        self.fval = f(&self.ext);
        self.dfmin = 8.0 * self.precision.eps2 * (self.fval.abs() + self.strategy.error_level);
        self.ready = true;
        Ok(())
    }

    /// Refine one parameter's `(grad, g2, gstep)` at the point cached by
    /// [`NumericalDerivator::setup`].
    ///
    /// Runs up to `ncycles` cycles of the step-refinement loop; breaking on
    /// either convergence test. Fixed parameters are left untouched.
    ///
    /// # Errors
    /// - [`GradError::SetupMissing`] without a prior `setup`.
    /// - [`GradError::ComponentOutOfRange`] for a bad index.
    pub fn differentiate_component<F: Fn(&[f64]) -> f64>(
        &mut self, i: usize, f: &F,
    ) -> GradResult<()> {
        if !self.ready {
            return Err(GradError::SetupMissing);
        }
        if i >= self.dim() {
            return Err(GradError::ComponentOutOfRange { index: i, dim: self.dim() });
        }
        if self.settings[i].fixed {
            return Ok(());
        }

        let eps2 = self.precision.eps2;
        let vrysml = self.precision.vrysml();
        let step_tol = self.strategy.step_tolerance;
        let grad_tol = self.strategy.grad_tolerance;
        let has_limits = self.settings[i].has_limits();
        let transform = self.transforms[i];

        let xtf = self.int[i];
        let epspri = eps2 + self.grad[i].abs() * eps2;
        let mut step_old = 0.0;

        for _ in 0..self.strategy.ncycles {
            let optstp = (self.dfmin / (self.g2[i].abs() + epspri)).sqrt();
            let mut step = optstp.max((0.1 * self.gstep[i]).abs());
            if has_limits && step > 0.5 {
                step = 0.5;
            }
            let stpmax = 10.0 * self.gstep[i].abs();
            if step > stpmax {
                step = stpmax;
            }
            let stpmin = vrysml.max(8.0 * (eps2 * xtf).abs());
            if step < stpmin {
                step = stpmin;
            }
            // stpmin > 0 by construction, so the relative test below is safe.
            debug_assert!(step > 0.0, "step size underflowed to zero");
            if ((step - step_old) / step).abs() < step_tol {
                break;
            }
            self.gstep[i] = step;
            step_old = step;

            self.ext[i] = transform.int2ext(xtf + step);
            let fs1 = f(&self.ext);
            self.ext[i] = transform.int2ext(xtf - step);
            let fs2 = f(&self.ext);
            self.ext[i] = transform.int2ext(xtf);

            let grad_old = self.grad[i];
            self.grad[i] = 0.5 * (fs1 - fs2) / step;
            self.g2[i] = (fs1 + fs2 - 2.0 * self.fval) / (step * step);

            if (grad_old - self.grad[i]).abs() / (self.grad[i].abs() + self.dfmin / step) < grad_tol
            {
                break;
            }
        }
        Ok(())
    }

    /// Full derivative sweep: `setup` followed by every component in
    /// ascending order.
    pub fn differentiate<F: Fn(&[f64]) -> f64>(&mut self, x: &[f64], f: &F) -> GradResult<()> {
        self.setup(x, f)?;
        for i in 0..self.dim() {
            self.differentiate_component(i, f)?;
        }
        Ok(())
    }

    /// Seed `(grad, g2, gstep)` from the settings' step widths.
    ///
    /// For each parameter the settings' step (`werr`) is mapped into
    /// internal space through limit clipping and the transform; the seeded
    /// curvature is that of a quadratic with error level `Up` at distance
    /// `dirin`, and the seeded step is a tenth of it, floored at `gsmin`.
    ///
    /// # Errors
    /// - [`GradError::DimensionMismatch`] when `x.len()` differs from the
    ///   parameter count.
    pub fn set_initial_gradient(&mut self, x: &[f64]) -> GradResult<()> {
        if x.len() != self.dim() {
            return Err(GradError::DimensionMismatch { expected: self.dim(), actual: x.len() });
        }
        let eps2 = self.precision.eps2;
        let up = self.strategy.error_level;

        for i in 0..self.dim() {
            let settings = &self.settings[i];
            let transform = self.transforms[i];
            let var = x[i];
            let werr = settings.step;

            let sav = transform.int2ext(var);
            let sav_plus = settings.clip_to_upper(sav + werr);
            let vplu = transform.ext2int(sav_plus) - var;
            let sav_minus = settings.clip_to_lower(sav - werr);
            let vmin = transform.ext2int(sav_minus) - var;

            let gsmin = 8.0 * eps2 * (var.abs() + eps2);
            // gsmin > 0, so dirin cannot collapse even when both clipped
            // displacements vanish.
            let dirin = (0.5 * (vplu.abs() + vmin.abs())).max(gsmin);
            debug_assert!(dirin > 0.0, "seeding step collapsed to zero");

            let g2 = 2.0 * up / (dirin * dirin);
            let mut gstep = gsmin.max(0.1 * dirin);
            if settings.has_limits() && gstep > 0.5 {
                gstep = 0.5;
            }
            self.grad[i] = g2 * dirin;
            self.g2[i] = g2;
            self.gstep[i] = gstep;
        }
        self.ready = false;
        Ok(())
    }

    /// Gradient converted to external scale through the transform Jacobian,
    /// `grad_ext_i = grad_i / (d int2ext / d int)(x_i)`.
    ///
    /// Meaningful after a `setup`/`differentiate` at the current point;
    /// identity transforms pass the internal gradient through unchanged.
    pub fn external_gradient(&self) -> Array1<f64> {
        Array1::from_iter(self.grad.iter().zip(&self.transforms).zip(&self.int).map(
            |((&g, transform), &xi)| {
                let d = transform.d_int2ext(xi);
                if d == 0.0 { g } else { g / d }
            },
        ))
    }
}
