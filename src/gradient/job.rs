//! gradient::job — the distributed gradient as a task-manager job.
//!
//! Purpose
//! -------
//! Bind the numerical derivator to the multiprocess Job contract: one task
//! is one partial derivative. The master broadcasts the point, enqueues N
//! tasks, and drains the refined `(grad, g2, gstep)` triples; each worker
//! refines the components it stole from the queue against its own replica
//! of the derivator and evaluator.
//!
//! Key behaviors
//! -------------
//! - [`GradientJob::calculate`] runs one full distributed gradient at a
//!   point: broadcast changed coordinates, enqueue all component tasks,
//!   switch workers into work mode, retrieve, switch back.
//! - Task results cross the wire as exactly three `f64` per component; the
//!   retrieve drain is a task-indexed list, so arrival order never
//!   matters.
//! - The minimizer-facing surface (`fill_*`, `synchronize_*`) mirrors what
//!   a gradient-based minimizer consumes: the three state vectors, the
//!   strategy options, and re-seeding from fresh parameter settings.
//!
//! Invariants & assumptions
//! ------------------------
//! - The job registers with its manager at construction and deregisters on
//!   drop; construction after activation fails.
//! - Workers share the pre-fork point and settings; coordinate changes
//!   arrive only through `update_real`, which marks the local baseline
//!   dirty so the next task re-caches `f(x)`.
//! - Running the same point with the same state twice yields bytewise
//!   identical triples; the pipeline adds no nondeterminism.
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use log::warn;

use crate::gradient::{
    derivator::NumericalDerivator,
    errors::{GradError, GradResult},
    strategy::GradientStrategy,
};
use crate::likelihood::Evaluator;
use crate::multiprocess::{Job, MpError, MpResult, TaskManager};
use crate::params::{ParameterSettings, ParameterTransform};

/// Bytes of one task result on the wire: `(grad, g2, gstep)`.
const TRIPLE_BYTES: usize = 3 * 8;
/// Bytes of one retrieve-drain entry: task id plus the triple.
const ENTRY_BYTES: usize = 8 + TRIPLE_BYTES;

/// Strategy and error-level options as a minimizer forwards them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizerOptions {
    pub gradient_step_tolerance: f64,
    pub gradient_tolerance: f64,
    pub gradient_ncycles: usize,
    pub error_level: f64,
}

impl MinimizerOptions {
    /// Validate into a [`GradientStrategy`].
    pub fn strategy(&self) -> GradResult<GradientStrategy> {
        GradientStrategy::new(
            self.gradient_step_tolerance,
            self.gradient_tolerance,
            self.gradient_ncycles,
            self.error_level,
        )
    }
}

/// Map settings to the internal-space point the derivator walks in.
fn internal_point(settings: &[ParameterSettings], mimic_transforms: bool) -> Vec<f64> {
    settings
        .iter()
        .map(|s| {
            if mimic_transforms {
                ParameterTransform::for_settings(s).ext2int(s.value)
            } else {
                s.value
            }
        })
        .collect()
}

struct JobState {
    derivator: NumericalDerivator,
    settings: Vec<ParameterSettings>,
    /// Current point, internal coordinates. Replicated to workers via
    /// `update_real`.
    x: Vec<f64>,
    /// The baseline `f(x)` cache is stale (worker side).
    dirty: bool,
    /// Queue-side result store, task-indexed.
    results: Vec<Option<[f64; 3]>>,
}

/// The gradient computation as a registered job.
///
/// Construct with [`GradientJob::new`]; drop deregisters. All distributed
/// work goes through [`GradientJob::calculate`].
pub struct GradientJob {
    manager: Rc<TaskManager>,
    job_id: Cell<usize>,
    evaluator: Rc<dyn Evaluator>,
    mimic_transforms: bool,
    state: RefCell<JobState>,
}

impl GradientJob {
    /// Build the job, seed the initial gradient from the settings, and
    /// register with the manager.
    ///
    /// # Errors
    /// - [`GradError::DimensionMismatch`] when the evaluator and settings
    ///   disagree on the parameter count.
    /// - [`GradError::TaskManager`] when registration fails (activated
    ///   manager).
    pub fn new(
        manager: &Rc<TaskManager>, evaluator: Rc<dyn Evaluator>,
        settings: &[ParameterSettings], strategy: GradientStrategy, mimic_transforms: bool,
    ) -> GradResult<Rc<GradientJob>> {
        if evaluator.dim() != settings.len() {
            return Err(GradError::DimensionMismatch {
                expected: evaluator.dim(),
                actual: settings.len(),
            });
        }
        let mut derivator = NumericalDerivator::new(settings, strategy, mimic_transforms);
        let x = internal_point(settings, mimic_transforms);
        derivator.set_initial_gradient(&x)?;

        let n = settings.len();
        let job = Rc::new(GradientJob {
            manager: Rc::clone(manager),
            job_id: Cell::new(usize::MAX),
            evaluator,
            mimic_transforms,
            state: RefCell::new(JobState {
                derivator,
                settings: settings.to_vec(),
                x,
                dirty: true,
                results: vec![None; n],
            }),
        });
        let job_dyn: Rc<dyn Job> = job.clone();
        let weak: Weak<dyn Job> = Rc::downgrade(&job_dyn);
        let job_id = manager.attach(weak)?;
        job.job_id.set(job_id);
        Ok(job)
    }

    pub fn job_id(&self) -> usize {
        self.job_id.get()
    }

    pub fn dim(&self) -> usize {
        self.state.borrow().x.len()
    }

    /// Compute the gradient at `x` (internal coordinates) across the
    /// worker pool.
    ///
    /// Broadcasts changed coordinates, enqueues one task per parameter,
    /// switches the workers into work mode, retrieves the aggregated
    /// triples, and switches back to idle so the next broadcast lands in a
    /// quiet pool.
    ///
    /// # Errors
    /// - [`GradError::DimensionMismatch`] for a wrong-length point.
    /// - [`GradError::TaskManager`] for any transport or protocol failure.
    pub fn calculate(&self, x: &[f64]) -> GradResult<()> {
        let job_id = self.job_id.get();
        let changed: Vec<(usize, f64, bool)> = {
            let state = self.state.borrow();
            if x.len() != state.x.len() {
                return Err(GradError::DimensionMismatch {
                    expected: state.x.len(),
                    actual: x.len(),
                });
            }
            x.iter()
                .enumerate()
                .filter(|&(i, v)| state.x[i].to_bits() != v.to_bits())
                .map(|(i, &v)| (i, v, state.settings[i].fixed))
                .collect()
        };

        self.manager.activate()?;
        for &(i, v, fixed) in &changed {
            self.manager.update_real(job_id, i, v, fixed)?;
        }
        {
            let mut state = self.state.borrow_mut();
            state.x.copy_from_slice(x);
            state.dirty = true;
        }

        let n = x.len();
        for task in 0..n {
            self.manager.enqueue(job_id, task)?;
        }
        self.manager.set_work_mode(true)?;
        self.manager.retrieve()?;
        self.manager.set_work_mode(false)?;
        Ok(())
    }

    // ---- Minimizer-facing surface ----

    /// Copy the first-derivative vector into `out`.
    pub fn fill_gradient(&self, out: &mut [f64]) {
        let state = self.state.borrow();
        debug_assert_eq!(out.len(), state.derivator.dim());
        for (slot, value) in out.iter_mut().zip(state.derivator.grad()) {
            *slot = *value;
        }
    }

    /// Copy the second-derivative vector into `out`.
    pub fn fill_second_derivative(&self, out: &mut [f64]) {
        let state = self.state.borrow();
        debug_assert_eq!(out.len(), state.derivator.dim());
        for (slot, value) in out.iter_mut().zip(state.derivator.g2()) {
            *slot = *value;
        }
    }

    /// Copy the step-size vector into `out`.
    pub fn fill_step_size(&self, out: &mut [f64]) {
        let state = self.state.borrow();
        debug_assert_eq!(out.len(), state.derivator.dim());
        for (slot, value) in out.iter_mut().zip(state.derivator.gstep()) {
            *slot = *value;
        }
    }

    /// Forward strategy and error level from the minimizer.
    pub fn synchronize_with_minimizer(&self, options: &MinimizerOptions) -> GradResult<()> {
        let strategy = options.strategy()?;
        self.state.borrow_mut().derivator.set_strategy(strategy);
        Ok(())
    }

    /// Replace the parameter settings and reseed the gradient state.
    ///
    /// Settings define the process-shared baseline, so this must happen
    /// before the topology forks.
    ///
    /// # Errors
    /// - [`GradError::TaskManager`] when called after activation.
    pub fn synchronize_parameter_settings(
        &self, settings: &[ParameterSettings],
    ) -> GradResult<()> {
        if self.manager.is_activated() {
            return Err(GradError::from(MpError::AlreadyActivated));
        }
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        state.settings = settings.to_vec();
        state.derivator.synchronize_settings(settings);
        state.x = internal_point(settings, self.mimic_transforms);
        state.results = vec![None; settings.len()];
        state.derivator.set_initial_gradient(&state.x)?;
        state.dirty = true;
        Ok(())
    }
}

impl Job for GradientJob {
    fn evaluate_task(&self, task: usize) -> MpResult<()> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let evaluator = &self.evaluator;
        let f = |ext: &[f64]| evaluator.value(ext);
        if state.dirty {
            state
                .derivator
                .setup(&state.x, &f)
                .map_err(|e| MpError::TaskFailed { task, message: e.to_string() })?;
            state.dirty = false;
        }
        state
            .derivator
            .differentiate_component(task, &f)
            .map_err(|e| MpError::TaskFailed { task, message: e.to_string() })
    }

    fn task_result_bytes(&self, task: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let triple = [
            state.derivator.grad()[task],
            state.derivator.g2()[task],
            state.derivator.gstep()[task],
        ];
        bytemuck::cast_slice(&triple).to_vec()
    }

    fn receive_task_result_on_queue(
        &self, task: usize, _worker_id: usize, bytes: &[u8],
    ) -> MpResult<()> {
        if bytes.len() != TRIPLE_BYTES {
            return Err(MpError::ResultSize {
                job_id: self.job_id.get(),
                expected: TRIPLE_BYTES,
                actual: bytes.len(),
            });
        }
        let mut triple = [0.0_f64; 3];
        for (slot, chunk) in triple.iter_mut().zip(bytes.chunks_exact(8)) {
            *slot = bytemuck::pod_read_unaligned(chunk);
        }
        let mut state = self.state.borrow_mut();
        if task >= state.results.len() {
            return Err(MpError::TaskFailed { task, message: "task index out of range".into() });
        }
        state.results[task] = Some(triple);
        Ok(())
    }

    fn queue_results_bytes(&self) -> Vec<u8> {
        let state = self.state.borrow();
        let entries: Vec<(usize, [f64; 3])> = state
            .results
            .iter()
            .enumerate()
            .filter_map(|(task, triple)| triple.map(|t| (task, t)))
            .collect();
        let mut bytes = Vec::with_capacity(8 + entries.len() * ENTRY_BYTES);
        bytes.extend_from_slice(&(entries.len() as u64).to_ne_bytes());
        for (task, triple) in entries {
            bytes.extend_from_slice(&(task as u64).to_ne_bytes());
            bytes.extend_from_slice(bytemuck::cast_slice(&triple));
        }
        bytes
    }

    fn receive_results_on_master(&self, bytes: &[u8]) -> MpResult<()> {
        let job_id = self.job_id.get();
        let too_short =
            |actual: usize| MpError::ResultSize { job_id, expected: 8, actual };
        let count_bytes: [u8; 8] =
            bytes.get(..8).and_then(|b| b.try_into().ok()).ok_or(too_short(bytes.len()))?;
        let count = u64::from_ne_bytes(count_bytes) as usize;
        let expected = 8 + count * ENTRY_BYTES;
        if bytes.len() != expected {
            return Err(MpError::ResultSize { job_id, expected, actual: bytes.len() });
        }
        let mut state = self.state.borrow_mut();
        for entry in bytes[8..].chunks_exact(ENTRY_BYTES) {
            let task = u64::from_ne_bytes(
                entry[..8].try_into().map_err(|_| too_short(entry.len()))?,
            ) as usize;
            if task >= state.derivator.dim() {
                return Err(MpError::TaskFailed {
                    task,
                    message: "drained task index out of range".into(),
                });
            }
            let grad: f64 = bytemuck::pod_read_unaligned(&entry[8..16]);
            let g2: f64 = bytemuck::pod_read_unaligned(&entry[16..24]);
            let gstep: f64 = bytemuck::pod_read_unaligned(&entry[24..32]);
            state.derivator.set_component(task, grad, g2, gstep);
        }
        Ok(())
    }

    fn clear_results(&self) {
        let mut state = self.state.borrow_mut();
        let n = state.results.len();
        state.results = vec![None; n];
    }

    fn update_real(&self, ix: usize, val: f64, is_const: bool) {
        let mut state = self.state.borrow_mut();
        if ix >= state.x.len() {
            warn!("update_real for coordinate {ix} beyond dimension {}; ignored", state.x.len());
            return;
        }
        state.x[ix] = val;
        state.settings[ix].fixed = is_const;
        state.derivator.set_fixed(ix, is_const);
        state.dirty = true;
    }

    fn call_double_const_method(&self, key: &str) -> MpResult<f64> {
        match key {
            "likelihood_carry" => Ok(self.evaluator.carry()),
            "likelihood_value" => {
                let state = self.state.borrow();
                Ok(state.derivator.fval())
            }
            _ => Err(MpError::UnsupportedMethod { key: key.to_string() }),
        }
    }
}

impl Drop for GradientJob {
    fn drop(&mut self) {
        self.manager.detach(self.job_id.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::Quadratic;
    use crate::multiprocess::{TopologyConfig, Transport};
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // Single-process tests of the job's state machinery: registration,
    // evaluation, wire serialization through the queue/master stations,
    // and the minimizer-facing surface. No forking happens here; the
    // stations are driven directly.
    //
    // Distributed behavior is covered by tests/multiprocess.rs.
    // -------------------------------------------------------------------------

    fn quadratic_fixture() -> (Rc<TaskManager>, Rc<GradientJob>) {
        let manager = TaskManager::new(TopologyConfig::new(1, Transport::SharedMemory, false))
            .expect("fresh manager");
        let evaluator = Rc::new(
            Quadratic::new(array![[1.0, 0.0], [0.0, 4.0]], array![-2.0, 16.0], 17.0).unwrap(),
        );
        let settings = vec![
            ParameterSettings::unbounded("x0", 0.0, 0.1).unwrap(),
            ParameterSettings::unbounded("x1", 0.0, 0.1).unwrap(),
        ];
        let job = GradientJob::new(
            &manager,
            evaluator,
            &settings,
            GradientStrategy::default(),
            false,
        )
        .expect("job construction");
        (manager, job)
    }

    #[test]
    // Purpose
    // -------
    // One task evaluated in place must round-trip through the worker,
    // queue, and master serialization stations unchanged.
    //
    // Given
    // -----
    // - The two-parameter quadratic fixture; task 1 evaluated directly.
    //
    // Expect
    // ------
    // - After receive_task_result_on_queue + queue_results_bytes +
    //   receive_results_on_master, the derivator's component 1 matches the
    //   locally computed triple bitwise.
    fn task_result_round_trips_through_all_stations() {
        let (_manager, job) = quadratic_fixture();

        job.evaluate_task(1).expect("evaluation succeeds");
        let bytes = job.task_result_bytes(1);
        assert_eq!(bytes.len(), TRIPLE_BYTES);

        let mut expected = [0.0; 2];
        job.fill_gradient(&mut expected);

        job.receive_task_result_on_queue(1, 0, &bytes).expect("queue store");
        let drain = job.queue_results_bytes();
        job.clear_results();

        // Perturb the master state, then merge the drain back.
        job.state.borrow_mut().derivator.set_component(1, 0.0, 0.0, 1.0);
        job.receive_results_on_master(&drain).expect("master merge");

        let mut merged = [0.0; 2];
        job.fill_gradient(&mut merged);
        assert_eq!(merged[1].to_bits(), expected[1].to_bits());
    }

    #[test]
    // Purpose
    // -------
    // A malformed task payload is a protocol-grade error, not a panic.
    //
    // Given
    // -----
    // - A 23-byte payload (one byte short of a triple).
    //
    // Expect
    // ------
    // - MpError::ResultSize with the expected length.
    fn short_result_payload_is_rejected() {
        let (_manager, job) = quadratic_fixture();
        let err = job
            .receive_task_result_on_queue(0, 0, &[0u8; 23])
            .expect_err("short payload must fail");
        match err {
            MpError::ResultSize { expected, actual, .. } => {
                assert_eq!(expected, TRIPLE_BYTES);
                assert_eq!(actual, 23);
            }
            other => panic!("Expected ResultSize, got {other:?}"),
        }
    }

    #[test]
    // Purpose
    // -------
    // update_real must move the point, flag the baseline dirty, and carry
    // constness onto the settings.
    //
    // Given
    // -----
    // - The quadratic fixture after one evaluation (clean baseline).
    //
    // Expect
    // ------
    // - x[0] updated, dirty set, fixed flag set.
    fn update_real_moves_point_and_marks_dirty() {
        let (_manager, job) = quadratic_fixture();
        job.evaluate_task(0).unwrap();
        assert!(!job.state.borrow().dirty);

        job.update_real(0, 2.5, true);
        let state = job.state.borrow();
        assert_eq!(state.x[0], 2.5);
        assert!(state.dirty);
        assert!(state.settings[0].fixed);
    }

    #[test]
    // Purpose
    // -------
    // The scalar remote-call keys dispatch to the evaluator and the
    // cached value; unknown keys are rejected.
    //
    // Given
    // -----
    // - The quadratic fixture with a cached baseline at (0, 0).
    //
    // Expect
    // ------
    // - "likelihood_value" returns f(0,0) = 17; "likelihood_carry" is 0;
    //   an unknown key yields UnsupportedMethod.
    fn const_method_keys_dispatch() {
        let (_manager, job) = quadratic_fixture();
        job.evaluate_task(0).unwrap();
        assert_eq!(job.call_double_const_method("likelihood_value").unwrap(), 17.0);
        assert_eq!(job.call_double_const_method("likelihood_carry").unwrap(), 0.0);
        assert!(matches!(
            job.call_double_const_method("no_such_key"),
            Err(MpError::UnsupportedMethod { .. })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Minimizer options pass through validation on their way to the
    // derivator.
    //
    // Given
    // -----
    // - A valid option set and one with a zero cycle count.
    //
    // Expect
    // ------
    // - The valid set is accepted; the zero-cycle set is rejected with
    //   InvalidNCycles.
    fn minimizer_options_are_validated_on_forward() {
        let (_manager, job) = quadratic_fixture();
        let valid = MinimizerOptions {
            gradient_step_tolerance: 0.3,
            gradient_tolerance: 0.05,
            gradient_ncycles: 3,
            error_level: 0.5,
        };
        job.synchronize_with_minimizer(&valid).expect("valid options accepted");

        let invalid = MinimizerOptions { gradient_ncycles: 0, ..valid };
        assert!(matches!(
            job.synchronize_with_minimizer(&invalid),
            Err(GradError::InvalidNCycles { .. })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Re-synchronizing parameter settings reseeds the state and respects
    // the limited-parameter clamp.
    //
    // Given
    // -----
    // - The fixture re-synchronized with parameter 0 limited to
    //   [-0.3, 0.3].
    //
    // Expect
    // ------
    // - The seeded step of parameter 0 is at most 0.5 and the job reports
    //   the new dimension unchanged.
    fn synchronize_settings_reseeds_with_clamp() {
        let (_manager, job) = quadratic_fixture();
        let settings = vec![
            ParameterSettings::limited("x0", 0.0, 0.1, -0.3, 0.3).unwrap(),
            ParameterSettings::unbounded("x1", 0.0, 0.1).unwrap(),
        ];
        job.synchronize_parameter_settings(&settings).expect("resync before activation");
        let mut gstep = [0.0; 2];
        job.fill_step_size(&mut gstep);
        assert!(gstep[0] <= 0.5);
        assert_eq!(job.dim(), 2);
    }
}
