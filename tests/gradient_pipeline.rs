//! Integration tests for the serial gradient pipeline.
//!
//! Purpose
//! -------
//! - Validate the numerical kernel end to end on closed-form objectives:
//!   reference numbers, convergence against analytic gradients, seeding
//!   behavior for limited parameters, and determinism.
//! - Cross-check the adaptive kernel against an independent
//!   finite-difference implementation (`finitediff`).
//! - Exercise the minimizer-facing contract by driving an `argmin`
//!   steepest-descent solver whose gradients come from the derivator.
//!
//! Coverage
//! --------
//! - `gradient::derivator`: `differentiate`, `set_initial_gradient`,
//!   strategy presets.
//! - `params`: settings construction and the limited-parameter transform
//!   path through the kernel.
//! - `likelihood`: quadratic and binned-Poisson evaluators as objectives.
//!
//! Exclusions
//! ----------
//! - Fork-based distribution and task-manager protocols: see
//!   `tests/multiprocess.rs`.
//! - Fine-grained validation of the building blocks, covered by unit
//!   tests in their modules.
use std::cell::RefCell;

use argmin::core::{CostFunction, Error, Executor, Gradient, State};
use argmin::solver::gradientdescent::SteepestDescent;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use finitediff::FiniteDiff;
use ndarray::{array, Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use parfit::gradient::{GradientStrategy, NumericalDerivator};
use parfit::likelihood::{BinnedNll, Evaluator, Quadratic};
use parfit::params::ParameterSettings;

/// Two-parameter quadratic of the reference scenarios:
/// f = (x0 − 1)² + 4·(x1 + 2)², minimum at (1, −2).
fn reference_quadratic() -> Quadratic {
    Quadratic::new(array![[1.0, 0.0], [0.0, 4.0]], array![-2.0, 16.0], 17.0)
        .expect("well-formed quadratic")
}

fn unbounded_pair() -> Vec<ParameterSettings> {
    vec![
        ParameterSettings::unbounded("x0", 0.0, 0.1).unwrap(),
        ParameterSettings::unbounded("x1", 0.0, 0.1).unwrap(),
    ]
}

#[test]
// Purpose
// -------
// Scenario "scalar square": f(x0) = x0² at x0 = 3 with the default
// initial state, ncycles = 2, Up = 1, tolerances (0.5, 0.1).
//
// Given
// -----
// - A one-parameter derivator with default strategy.
//
// Expect
// ------
// - grad within 1e-6 of 6.0; g2 within 1e-4 of 2.0.
fn scalar_square_reference() {
    let settings = vec![ParameterSettings::unbounded("x0", 3.0, 0.1).unwrap()];
    let mut derivator =
        NumericalDerivator::new(&settings, GradientStrategy::default(), false);
    derivator.differentiate(&[3.0], &|x: &[f64]| x[0] * x[0]).unwrap();
    assert!((derivator.grad()[0] - 6.0).abs() < 1e-6);
    assert!((derivator.g2()[0] - 2.0).abs() < 1e-4);
}

#[test]
// Purpose
// -------
// Scenario "two-parameter quadratic" at x = (0, 0).
//
// Given
// -----
// - f = (x0 − 1)² + 4·(x1 + 2)².
//
// Expect
// ------
// - grad ≈ (−2, 16), g2 ≈ (2, 8).
fn two_parameter_quadratic_reference() {
    let f = reference_quadratic();
    let mut derivator =
        NumericalDerivator::new(&unbounded_pair(), GradientStrategy::default(), false);
    derivator.differentiate(&[0.0, 0.0], &|x: &[f64]| f.value(x)).unwrap();
    assert!((derivator.grad()[0] + 2.0).abs() < 1e-4);
    assert!((derivator.grad()[1] - 16.0).abs() < 1e-4);
    assert!((derivator.g2()[0] - 2.0).abs() < 1e-2);
    assert!((derivator.g2()[1] - 8.0).abs() < 1e-2);
}

#[test]
// Purpose
// -------
// Scenario "limited parameter clamp": same objective, parameter 0
// limited to [-0.3, 0.3].
//
// Given
// -----
// - Exact Minuit mimicry on, seeding at the settings point.
//
// Expect
// ------
// - After seeding, gstep0 ≤ 0.5 and g2 ≥ 0; differentiation still
//   returns a finite grad0.
fn limited_parameter_clamp() {
    let f = reference_quadratic();
    let settings = vec![
        ParameterSettings::limited("x0", 0.0, 0.1, -0.3, 0.3).unwrap(),
        ParameterSettings::unbounded("x1", 0.0, 0.1).unwrap(),
    ];
    let mut derivator = NumericalDerivator::new(&settings, GradientStrategy::default(), true);
    derivator.set_initial_gradient(&[0.0, 0.0]).unwrap();
    assert!(derivator.gstep()[0] <= 0.5);
    assert!(derivator.g2()[0] >= 0.0);

    derivator.differentiate(&[0.0, 0.0], &|x: &[f64]| f.value(x)).unwrap();
    assert!(derivator.grad()[0].is_finite());
    assert!(derivator.gstep()[0] <= 0.5);
}

#[test]
// Purpose
// -------
// Convergence on a positive-definite quadratic: the refined gradient
// matches 2Ax + b well inside the strategy's step tolerance.
//
// Given
// -----
// - The high strategy (5 cycles) at a generic point (0.7, −0.4).
//
// Expect
// ------
// - Relative error of each component below 1e-5.
fn quadratic_converges_to_analytic_gradient() {
    let f = reference_quadratic();
    let x = [0.7, -0.4];
    let mut derivator =
        NumericalDerivator::new(&unbounded_pair(), GradientStrategy::high(1.0).unwrap(), false);
    derivator.differentiate(&x, &|v: &[f64]| f.value(v)).unwrap();

    let analytic = f.analytic_gradient(&x);
    for i in 0..2 {
        let rel = (derivator.grad()[i] - analytic[i]).abs() / analytic[i].abs();
        assert!(rel < 1e-5, "component {i}: {} vs {}", derivator.grad()[i], analytic[i]);
    }
}

#[test]
// Purpose
// -------
// Independent cross-check: the adaptive kernel and finitediff's plain
// central difference agree on a smooth objective.
//
// Given
// -----
// - The reference quadratic at (0.3, 0.9).
//
// Expect
// ------
// - Component-wise agreement within 1e-4.
fn agrees_with_independent_central_difference() {
    let f = reference_quadratic();
    let x = [0.3, 0.9];

    let mut derivator =
        NumericalDerivator::new(&unbounded_pair(), GradientStrategy::high(1.0).unwrap(), false);
    derivator.differentiate(&x, &|v: &[f64]| f.value(v)).unwrap();

    let point = Array1::from(x.to_vec());
    let independent = point.central_diff(&|v: &Array1<f64>| f.value(v.as_slice().unwrap()));

    for i in 0..2 {
        assert!(
            (derivator.grad()[i] - independent[i]).abs() < 1e-4,
            "component {i}: {} vs {}",
            derivator.grad()[i],
            independent[i]
        );
    }
}

#[test]
// Purpose
// -------
// The kernel handles a realistic likelihood: a binned Poisson template
// fit whose NLL gradient vanishes at the generating coefficient.
//
// Given
// -----
// - Counts drawn as exactly 2x a template; derivative taken at 2.0 and
//   at 1.5.
//
// Expect
// ------
// - |grad(2.0)| small; grad(1.5) < 0 (the NLL still falls toward 2).
fn binned_likelihood_gradient_behaves_at_minimum() {
    let template = vec![5.0, 10.0, 20.0, 10.0, 5.0];
    let counts: Vec<f64> = template.iter().map(|t| 2.0 * t).collect();
    let nll = BinnedNll::new(counts, vec![template]).unwrap();

    let settings = vec![ParameterSettings::unbounded("mu", 2.0, 0.1).unwrap()];
    let mut derivator =
        NumericalDerivator::new(&settings, GradientStrategy::medium(0.5).unwrap(), false);

    derivator.differentiate(&[2.0], &|x: &[f64]| nll.value(x)).unwrap();
    assert!(derivator.grad()[0].abs() < 1e-3, "grad at minimum = {}", derivator.grad()[0]);

    derivator.differentiate(&[1.5], &|x: &[f64]| nll.value(x)).unwrap();
    assert!(derivator.grad()[0] < 0.0);
}

#[test]
// Purpose
// -------
// Sweep randomized positive-definite diagonal quadratics: the kernel must
// track the analytic gradient across parameter scales and signs, not just
// the hand-picked reference cases.
//
// Given
// -----
// - Five seeded draws of diag(A) in (0.5, 3), b in (−2, 2), and points in
//   (−1.5, 1.5), dimension 4, high strategy.
//
// Expect
// ------
// - Every gradient component within 1e-4 absolute-plus-relative error of
//   2Ax + b.
fn random_diagonal_quadratics_match_analytic() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let n = 4;
        let diag: Vec<f64> = (0..n).map(|_| rng.random_range(0.5..3.0)).collect();
        let b = Array1::from_iter((0..n).map(|_| rng.random_range(-2.0..2.0)));
        let x: Vec<f64> = (0..n).map(|_| rng.random_range(-1.5..1.5)).collect();

        let a = Array2::from_diag(&Array1::from(diag));
        let f = Quadratic::new(a, b, 0.0).unwrap();

        let settings: Vec<ParameterSettings> = (0..n)
            .map(|i| ParameterSettings::unbounded(&format!("p{i}"), x[i], 0.1).unwrap())
            .collect();
        let mut derivator =
            NumericalDerivator::new(&settings, GradientStrategy::high(1.0).unwrap(), false);
        derivator.differentiate(&x, &|v: &[f64]| f.value(v)).unwrap();

        let analytic = f.analytic_gradient(&x);
        for i in 0..n {
            let err = (derivator.grad()[i] - analytic[i]).abs();
            assert!(
                err < 1e-4 * (1.0 + analytic[i].abs()),
                "component {i}: {} vs {}",
                derivator.grad()[i],
                analytic[i]
            );
        }
    }
}

// ---- Minimizer consumption ----

/// The derivator wired up as an argmin problem: cost from the evaluator,
/// gradient from the adaptive kernel.
struct DerivatorProblem {
    objective: Quadratic,
    derivator: RefCell<NumericalDerivator>,
}

impl CostFunction for DerivatorProblem {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.objective.value(param.as_slice().expect("contiguous param")))
    }
}

impl Gradient for DerivatorProblem {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        let mut derivator = self.derivator.borrow_mut();
        derivator
            .differentiate(param.as_slice().expect("contiguous param"), &|x: &[f64]| {
                self.objective.value(x)
            })
            .map_err(|e| Error::msg(e.to_string()))?;
        Ok(derivator.grad().clone())
    }
}

#[test]
// Purpose
// -------
// A gradient-based minimizer consuming the kernel's output must find the
// quadratic's minimum.
//
// Given
// -----
// - Steepest descent with a More–Thuente line search, 60 iterations,
//   gradients from the derivator at medium strategy.
//
// Expect
// ------
// - Best parameter within 1e-3 of (1, −2) and best cost within 1e-5 of 0.
fn minimizer_consumes_derivator_gradients() {
    let problem = DerivatorProblem {
        objective: reference_quadratic(),
        derivator: NumericalDerivator::new(
            &unbounded_pair(),
            GradientStrategy::medium(1.0).unwrap(),
            false,
        )
        .into(),
    };

    let linesearch: MoreThuenteLineSearch<Array1<f64>, Array1<f64>, f64> =
        MoreThuenteLineSearch::new();
    let solver = SteepestDescent::new(linesearch);

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(array![0.0, 0.0]).max_iters(60))
        .run()
        .expect("solver run succeeds");

    let state = result.state();
    let best = state.get_best_param().expect("best parameter present");
    assert!((best[0] - 1.0).abs() < 1e-3, "best = {best}");
    assert!((best[1] + 2.0).abs() < 1e-3, "best = {best}");
    assert!(state.get_best_cost() < 1e-5);
}
