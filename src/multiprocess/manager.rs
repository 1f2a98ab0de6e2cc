//! multiprocess::manager — master/queue/worker topology and protocols.
//!
//! Purpose
//! -------
//! Own the process topology and every protocol that runs over it: fork
//! construction, the queue process's dispatch loop, the worker loop's
//! work/idle state machine, the master's enqueue/retrieve/update/terminate
//! operations, and the job registry shared (by fork) across all processes.
//!
//! Key behaviors
//! -------------
//! - From the single initial process, [`TaskManager::activate`] forks N
//!   workers (each with its own `worker_id` and queue↔worker pipe), then
//!   forks the queue, which holds the queue side of every pipe. Master
//!   returns to its caller; queue and workers run their loops and `_exit`.
//! - All jobs must be registered before activation, so every post-fork
//!   registry replica is identical and `job_id` routing agrees everywhere.
//! - The queue loop imposes the only global order: it polls all pipes with
//!   infinite timeout and drains one framed message per readable pipe.
//! - Shutdown is cooperative and never panics: terminate messages fan out,
//!   exit statuses are collected, failures downgrade to warnings.
//!
//! Invariants & assumptions
//! ------------------------
//! - `retrieve_accepted` is sent if and only if the queue is empty and
//!   `n_completed == n_tasks`; counters reset after the drain.
//! - A worker whose dequeue was rejected blocks on the next queue message
//!   instead of re-asking. Tasks are always enqueued before work mode is
//!   switched on, so a rejection implies the queue has drained for this
//!   batch; the worker is woken by the mode switch that follows retrieve,
//!   or by terminate.
//! - Each process is single-threaded; manager state lives in `Cell`s and
//!   `RefCell`s and is never shared between threads.
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

use log::{debug, error, warn};

use crate::multiprocess::{
    errors::{MpError, MpResult},
    job::Job,
    messages::{JobTask, M2Q, Q2M, Q2W, W2Q},
    pipe::{poll_pipes, PipeEnd, PollEntry, Transport},
};

/// Exit code of a child process that died on a protocol or task failure.
const FATAL_EXIT: i32 = 70;

thread_local! {
    /// Convenience handle to the live instance; lifecycle stays explicit.
    static CURRENT: RefCell<Weak<TaskManager>> = const { RefCell::new(Weak::new()) };
}

/// Topology configuration fixed at manager construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Number of worker processes; must be nonzero.
    pub n_workers: usize,
    /// Transport used for every pipe in the topology.
    pub transport: Transport,
    /// Bind each process to its own CPU (best effort, Linux only).
    pub cpu_pinning: bool,
}

impl TopologyConfig {
    pub fn new(n_workers: usize, transport: Transport, cpu_pinning: bool) -> Self {
        TopologyConfig { n_workers, transport, cpu_pinning }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig { n_workers: 1, transport: Transport::SharedMemory, cpu_pinning: false }
    }
}

/// Which process this replica of the manager lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Queue,
    Worker(usize),
}

/// Pipes and pids owned by this process after the fork.
struct Topology {
    role: Role,
    /// Master: pipe to the queue. Queue: pipe to the master.
    queue_pipe: Option<PipeEnd>,
    /// Queue only: pipe per worker, index == worker id.
    worker_pipes: Vec<PipeEnd>,
    /// Worker only: this worker's pipe to the queue.
    worker_pipe: Option<PipeEnd>,
    /// Master only: worker pids to reap at shutdown.
    worker_pids: Vec<libc::pid_t>,
}

/// Process-wide task manager, re-architected from a hidden singleton into
/// an explicit context object.
///
/// Jobs hold an `Rc<TaskManager>`; the manager holds `Weak` references to
/// its jobs. Dropping the last job drops the last strong reference and the
/// manager tears down. [`TaskManager::current`] is a thread-local
/// convenience accessor; creation, activation, and teardown remain
/// explicit calls.
pub struct TaskManager {
    config: TopologyConfig,
    topology: RefCell<Option<Topology>>,
    activated: Cell<bool>,
    /// Master-side cache of the workers' mode; sends only on change.
    work_mode: Cell<bool>,

    registry: RefCell<BTreeMap<usize, Weak<dyn Job>>>,
    /// Monotonic; ids are never reused within a process lifetime.
    job_counter: Cell<usize>,

    // Queue-process state. Owned exclusively by the queue loop.
    queue: RefCell<VecDeque<JobTask>>,
    n_tasks: Cell<usize>,
    n_completed: Cell<usize>,
}

impl TaskManager {
    /// Construct the manager. Fails while a previous instance is alive.
    ///
    /// # Errors
    /// - [`MpError::NoWorkers`] for an empty topology.
    /// - [`MpError::InstanceAlive`] when another instance exists.
    pub fn new(config: TopologyConfig) -> MpResult<Rc<TaskManager>> {
        if config.n_workers == 0 {
            return Err(MpError::NoWorkers);
        }
        if CURRENT.with(|c| c.borrow().upgrade().is_some()) {
            return Err(MpError::InstanceAlive);
        }
        let manager = Rc::new(TaskManager {
            config,
            topology: RefCell::new(None),
            activated: Cell::new(false),
            work_mode: Cell::new(false),
            registry: RefCell::new(BTreeMap::new()),
            job_counter: Cell::new(0),
            queue: RefCell::new(VecDeque::new()),
            n_tasks: Cell::new(0),
            n_completed: Cell::new(0),
        });
        CURRENT.with(|c| *c.borrow_mut() = Rc::downgrade(&manager));
        Ok(manager)
    }

    /// The live instance, if one exists.
    ///
    /// # Errors
    /// - [`MpError::NoInstance`] without prior construction.
    pub fn current() -> MpResult<Rc<TaskManager>> {
        CURRENT.with(|c| c.borrow().upgrade()).ok_or(MpError::NoInstance)
    }

    pub fn n_workers(&self) -> usize {
        self.config.n_workers
    }

    /// Role of this process; `Master` before activation.
    pub fn role(&self) -> Role {
        self.topology.borrow().as_ref().map_or(Role::Master, |t| t.role)
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub fn is_queue(&self) -> bool {
        self.role() == Role::Queue
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.role(), Role::Worker(_))
    }

    pub fn worker_id(&self) -> Option<usize> {
        match self.role() {
            Role::Worker(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.get()
    }

    /// Log this process's role and pid.
    pub fn identify_processes(&self) {
        debug!("task manager process: role {:?}, pid {}", self.role(), std::process::id());
    }

    // ---- Job registry ----

    /// Register a job and hand out its id. Must precede activation.
    ///
    /// # Errors
    /// - [`MpError::AlreadyActivated`] once forking has taken place.
    pub fn attach(&self, job: Weak<dyn Job>) -> MpResult<usize> {
        if self.activated.get() {
            return Err(MpError::AlreadyActivated);
        }
        let job_id = self.job_counter.get();
        self.job_counter.set(job_id + 1);
        self.registry.borrow_mut().insert(job_id, job);
        Ok(job_id)
    }

    /// Deregister a job; tearing down the topology when it was the last.
    pub fn detach(&self, job_id: usize) {
        self.registry.borrow_mut().remove(&job_id);
        if self.registry.borrow().is_empty() {
            self.terminate();
        }
    }

    /// Look up a registered job in this process's replica.
    fn job(&self, job_id: usize) -> MpResult<Rc<dyn Job>> {
        self.registry
            .borrow()
            .get(&job_id)
            .and_then(Weak::upgrade)
            .ok_or(MpError::JobMissing { job_id })
    }

    // ---- Activation and topology construction ----

    /// Fork the topology and start the child loops. Idempotent. Returns
    /// only on the master; queue and workers `_exit` when their loops end.
    ///
    /// # Errors
    /// - Transport or fork failures during construction.
    pub fn activate(&self) -> MpResult<()> {
        if self.activated.get() {
            return Ok(());
        }
        self.initialize_processes()?;
        self.activated.set(true);

        match self.role() {
            Role::Master => Ok(()),
            Role::Queue => {
                let code = match self.queue_loop() {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("queue loop failed: {e}");
                        FATAL_EXIT
                    }
                };
                self.terminate_workers();
                // Safety: child process exit without running atexit hooks;
                // the master owns all shared resources.
                unsafe { libc::_exit(code) }
            }
            Role::Worker(_) => {
                let code = match self.worker_loop() {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("worker {:?} loop failed: {e}", self.worker_id());
                        FATAL_EXIT
                    }
                };
                // Safety: as above.
                unsafe { libc::_exit(code) }
            }
        }
    }

    /// Fork workers first, then the queue, wiring pipe ownership so the
    /// queue ends up holding the queue side of every pipe.
    fn initialize_processes(&self) -> MpResult<()> {
        let n = self.config.n_workers;
        let transport = self.config.transport;

        let mut queue_sides: Vec<PipeEnd> = Vec::with_capacity(n);
        let mut worker_pids: Vec<libc::pid_t> = Vec::with_capacity(n);
        let mut worker_end: Option<(usize, PipeEnd)> = None;

        for k in 0..n {
            let (queue_side, worker_side) = PipeEnd::pair(transport)?;
            // Safety: plain fork; the child keeps only its own pipe end.
            match unsafe { libc::fork() } {
                -1 => return Err(MpError::last_os("fork worker")),
                0 => {
                    // Worker child: release every queue-side end inherited
                    // from the parent, keep this worker's end.
                    queue_sides.clear();
                    worker_end = Some((k, worker_side));
                    break;
                }
                pid => {
                    worker_pids.push(pid);
                    queue_sides.push(queue_side);
                    drop(worker_side);
                }
            }
        }

        let topology = if let Some((k, worker_pipe)) = worker_end {
            Topology {
                role: Role::Worker(k),
                queue_pipe: None,
                worker_pipes: Vec::new(),
                worker_pipe: Some(worker_pipe),
                worker_pids: Vec::new(),
            }
        } else {
            let (mut master_side, queue_side) = PipeEnd::pair(transport)?;
            // Safety: final fork; both children of the initial process.
            match unsafe { libc::fork() } {
                -1 => return Err(MpError::last_os("fork queue")),
                0 => {
                    drop(master_side);
                    Topology {
                        role: Role::Queue,
                        queue_pipe: Some(queue_side),
                        worker_pipes: queue_sides,
                        worker_pipe: None,
                        worker_pids: Vec::new(),
                    }
                }
                pid => {
                    drop(queue_side);
                    queue_sides.clear();
                    master_side.attach_child(pid);
                    Topology {
                        role: Role::Master,
                        queue_pipe: Some(master_side),
                        worker_pipes: Vec::new(),
                        worker_pipe: None,
                        worker_pids,
                    }
                }
            }
        };

        if self.config.cpu_pinning {
            self.pin_cpu(topology.role);
        }
        *self.topology.borrow_mut() = Some(topology);
        self.identify_processes();
        Ok(())
    }

    /// Best-effort CPU binding: worker k to CPU k, queue to CPU N, master
    /// to CPU N+1. Failure is a warning; unsupported platforms skip.
    #[cfg(target_os = "linux")]
    fn pin_cpu(&self, role: Role) {
        let cpu = match role {
            Role::Master => self.config.n_workers + 1,
            Role::Queue => self.config.n_workers,
            Role::Worker(k) => k,
        };
        // Safety: zeroed cpu_set_t initialized through the libc macros;
        // affinity applies to the calling process only.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                warn!("could not set CPU affinity for {role:?}, continuing");
            } else {
                debug!("CPU affinity of {role:?} set to cpu {cpu}");
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn pin_cpu(&self, _role: Role) {}

    // ---- Master-side protocol operations ----

    fn with_queue_pipe<R>(
        &self, op: &'static str, f: impl FnOnce(&mut PipeEnd) -> MpResult<R>,
    ) -> MpResult<R> {
        let mut topology = self.topology.borrow_mut();
        let pipe = topology
            .as_mut()
            .and_then(|t| t.queue_pipe.as_mut())
            .ok_or(MpError::WrongRole { op })?;
        f(pipe)
    }

    /// Enqueue one task for a job; activates the topology on first use.
    pub fn enqueue(&self, job_id: usize, task: usize) -> MpResult<()> {
        self.activate()?;
        self.with_queue_pipe("enqueue", |pipe| {
            pipe.send_tag(M2Q::Enqueue);
            pipe.send_u64(job_id as u64);
            pipe.send_u64(task as u64);
            pipe.flush()
        })
    }

    /// Drain all completed results from the queue in one transaction.
    ///
    /// Loops on the handshake until the queue reports every task complete,
    /// then dispatches each job's result blob to
    /// [`Job::receive_results_on_master`].
    pub fn retrieve(&self) -> MpResult<()> {
        loop {
            let drained = self.with_queue_pipe("retrieve", |pipe| {
                pipe.send_tag(M2Q::Retrieve);
                pipe.flush()?;
                match pipe.recv_tag::<Q2M>()? {
                    Q2M::RetrieveRejected => Ok(None),
                    Q2M::RetrieveAccepted => {
                        let n_jobs = pipe.recv_u64()? as usize;
                        let mut blobs = Vec::with_capacity(n_jobs);
                        for _ in 0..n_jobs {
                            let job_id = pipe.recv_u64()? as usize;
                            blobs.push((job_id, pipe.recv_blob()?));
                        }
                        Ok(Some(blobs))
                    }
                }
            })?;
            if let Some(blobs) = drained {
                for (job_id, blob) in blobs {
                    self.job(job_id)?.receive_results_on_master(&blob)?;
                }
                return Ok(());
            }
            // Rejected: tasks still in flight; ask again (the queue
            // answers once n_completed == n_tasks, no sleep needed).
        }
    }

    /// Broadcast one coordinate update to every worker replica of a job.
    pub fn update_real(&self, job_id: usize, ix: usize, val: f64, is_const: bool) -> MpResult<()> {
        self.with_queue_pipe("update_real", |pipe| {
            pipe.send_tag(M2Q::UpdateReal);
            pipe.send_u64(job_id as u64);
            pipe.send_u64(ix as u64);
            pipe.send_f64(val);
            pipe.send_bool(is_const);
            pipe.flush()
        })
    }

    /// Toggle all workers between work mode and idle mode. Sends only on a
    /// change of the cached master-side flag.
    pub fn set_work_mode(&self, flag: bool) -> MpResult<()> {
        if !self.is_master() || self.work_mode.get() == flag {
            return Ok(());
        }
        self.work_mode.set(flag);
        self.with_queue_pipe("set_work_mode", |pipe| {
            pipe.send_tag(M2Q::SwitchWorkMode);
            pipe.flush()
        })
    }

    /// Call a named scalar method on one worker's replica of a job and
    /// relay the result back.
    ///
    /// Only well-defined while the pool is quiescent (workers idle, no
    /// task batch in flight); the queue consumes stale worker messages
    /// before awaiting the reply.
    pub fn call_double_const_method(
        &self, job_id: usize, worker_id: usize, key: &str,
    ) -> MpResult<f64> {
        self.with_queue_pipe("call_double_const_method", |pipe| {
            pipe.send_tag(M2Q::CallDoubleConstMethod);
            pipe.send_u64(job_id as u64);
            pipe.send_u64(worker_id as u64);
            pipe.send_blob(key.as_bytes());
            pipe.flush()?;
            pipe.recv_f64()
        })
    }

    /// Cooperative shutdown; never panics and swallows transport errors.
    ///
    /// On the master: send terminate, collect the queue's exit status,
    /// reap every worker pid, and reset counters so a fresh instance can
    /// activate later in the same process.
    pub fn terminate(&self) {
        if self.activated.get() && self.is_master() {
            if let Some(mut topology) = self.topology.borrow_mut().take() {
                if let Some(mut pipe) = topology.queue_pipe.take() {
                    if pipe.good() {
                        pipe.send_tag(M2Q::Terminate);
                        if let Err(e) = pipe.flush() {
                            warn!("terminate flush failed: {e}");
                        }
                        match pipe.close() {
                            Ok(0) => {}
                            Ok(code) => warn!("queue process exited with status {code}"),
                            Err(e) => warn!("could not collect queue exit status: {e}"),
                        }
                    }
                }
                for pid in topology.worker_pids.drain(..) {
                    let mut status: libc::c_int = 0;
                    // Safety: reaping children this process forked.
                    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
                    if rc < 0 {
                        warn!("could not reap worker pid {pid}");
                    } else if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
                        warn!("worker pid {pid} exited with status {}", libc::WEXITSTATUS(status));
                    }
                }
            }
        }
        *self.topology.borrow_mut() = None;
        self.activated.set(false);
        self.work_mode.set(false);
        self.queue.borrow_mut().clear();
        self.n_tasks.set(0);
        self.n_completed.set(0);
    }

    // ---- Queue process ----

    /// Poll-dispatch loop of the queue process. Returns when the master
    /// sends terminate; errors are fatal to the queue process.
    fn queue_loop(&self) -> MpResult<()> {
        loop {
            let mut topology_ref = self.topology.borrow_mut();
            let topology =
                topology_ref.as_mut().ok_or(MpError::WrongRole { op: "queue_loop" })?;

            let ready: Vec<usize> = {
                let Topology { queue_pipe, worker_pipes, .. } = topology;
                let master = queue_pipe.as_mut().ok_or(MpError::WrongRole { op: "queue_loop" })?;
                let mut entries = Vec::with_capacity(1 + worker_pipes.len());
                entries.push(PollEntry::new(master));
                for pipe in worker_pipes.iter_mut() {
                    entries.push(PollEntry::new(pipe));
                }
                poll_pipes(&mut entries, -1)?;
                entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.ready)
                    .map(|(ix, _)| ix)
                    .collect()
            };

            for ix in ready {
                if ix == 0 {
                    if !self.process_master_message(topology)? {
                        return Ok(());
                    }
                } else {
                    let k = ix - 1;
                    let pipe = &mut topology.worker_pipes[k];
                    self.process_worker_message(pipe, k)?;
                }
            }
        }
    }

    /// Handle one framed master message on the queue. Returns false on
    /// terminate.
    fn process_master_message(&self, topology: &mut Topology) -> MpResult<bool> {
        let Topology { queue_pipe, worker_pipes, .. } = topology;
        let master = queue_pipe.as_mut().ok_or(MpError::WrongRole { op: "queue dispatch" })?;

        match master.recv_tag::<M2Q>()? {
            M2Q::Terminate => return Ok(false),

            M2Q::Enqueue => {
                let job_id = master.recv_u64()? as usize;
                let task = master.recv_u64()? as usize;
                self.queue.borrow_mut().push_back(JobTask { job_id, task });
                self.n_tasks.set(self.n_tasks.get() + 1);
            }

            M2Q::Retrieve => {
                let complete = self.queue.borrow().is_empty()
                    && self.n_completed.get() == self.n_tasks.get();
                if complete {
                    // Gather per-job drains before touching the pipe; the
                    // BTreeMap order keeps the stream deterministic.
                    let jobs: Vec<(usize, Rc<dyn Job>)> = self
                        .registry
                        .borrow()
                        .iter()
                        .filter_map(|(&id, weak)| weak.upgrade().map(|j| (id, j)))
                        .collect();
                    master.send_tag(Q2M::RetrieveAccepted);
                    master.send_u64(jobs.len() as u64);
                    for (job_id, job) in jobs {
                        master.send_u64(job_id as u64);
                        master.send_blob(&job.queue_results_bytes());
                        job.clear_results();
                    }
                    self.n_tasks.set(0);
                    self.n_completed.set(0);
                    master.flush()?;
                } else {
                    master.send_tag(Q2M::RetrieveRejected);
                    master.flush()?;
                }
            }

            M2Q::UpdateReal => {
                let job_id = master.recv_u64()?;
                let ix = master.recv_u64()?;
                let val = master.recv_f64()?;
                let is_const = master.recv_bool()?;
                for pipe in worker_pipes.iter_mut() {
                    pipe.send_tag(Q2W::UpdateReal);
                    pipe.send_u64(job_id);
                    pipe.send_u64(ix);
                    pipe.send_f64(val);
                    pipe.send_bool(is_const);
                    pipe.flush()?;
                }
            }

            M2Q::SwitchWorkMode => {
                for pipe in worker_pipes.iter_mut() {
                    pipe.send_tag(Q2W::SwitchWorkMode);
                    pipe.flush()?;
                }
            }

            M2Q::CallDoubleConstMethod => {
                let job_id = master.recv_u64()?;
                let worker_ix = master.recv_u64()? as usize;
                let key = master.recv_blob()?;
                if worker_ix >= worker_pipes.len() {
                    return Err(MpError::Protocol {
                        context: "call_double_const_method worker index",
                        tag: worker_ix as u32,
                    });
                }
                // Consume anything the worker already sent (a stale
                // dequeue ask from the last mode boundary) so the next
                // bytes on its pipe are the awaited double.
                while worker_pipes[worker_ix].readable_now() {
                    self.process_worker_message(&mut worker_pipes[worker_ix], worker_ix)?;
                }
                let result = {
                    let pipe = &mut worker_pipes[worker_ix];
                    pipe.send_tag(Q2W::CallDoubleConstMethod);
                    pipe.send_u64(job_id);
                    pipe.send_blob(&key);
                    pipe.flush()?;
                    pipe.recv_f64()?
                };
                master.send_f64(result);
                master.flush()?;
            }
        }
        Ok(true)
    }

    /// Handle one framed message from worker `k` on the queue.
    fn process_worker_message(&self, pipe: &mut PipeEnd, k: usize) -> MpResult<()> {
        match pipe.recv_tag::<W2Q>()? {
            W2Q::Dequeue => {
                match self.queue.borrow_mut().pop_front() {
                    Some(job_task) => {
                        pipe.send_tag(Q2W::DequeueAccepted);
                        pipe.send_u64(job_task.job_id as u64);
                        pipe.send_u64(job_task.task as u64);
                    }
                    None => pipe.send_tag(Q2W::DequeueRejected),
                }
                pipe.flush()?;
            }
            W2Q::SendResult => {
                let job_id = pipe.recv_u64()? as usize;
                let task = pipe.recv_u64()? as usize;
                let blob = pipe.recv_blob()?;
                self.job(job_id)?.receive_task_result_on_queue(task, k, &blob)?;
                pipe.send_tag(Q2W::ResultReceived);
                pipe.flush()?;
                self.n_completed.set(self.n_completed.get() + 1);
            }
        }
        Ok(())
    }

    /// Fan out terminate to every worker and close their pipes.
    fn terminate_workers(&self) {
        if let Some(topology) = self.topology.borrow_mut().as_mut() {
            for (k, pipe) in topology.worker_pipes.iter_mut().enumerate() {
                pipe.send_tag(Q2W::Terminate);
                if let Err(e) = pipe.flush() {
                    warn!("terminate flush to worker {k} failed: {e}");
                }
                if let Err(e) = pipe.close() {
                    warn!("closing worker {k} pipe failed: {e}");
                }
            }
        }
    }

    // ---- Worker process ----

    /// Work/idle state machine of one worker process. Returns on
    /// terminate; errors are fatal to the worker process.
    fn worker_loop(&self) -> MpResult<()> {
        let mut topology_ref = self.topology.borrow_mut();
        let topology = topology_ref.as_mut().ok_or(MpError::WrongRole { op: "worker_loop" })?;
        let pipe =
            topology.worker_pipe.as_mut().ok_or(MpError::WrongRole { op: "worker_loop" })?;

        let mut work_mode = false;
        // One outstanding dequeue ask at a time; a rejected ask leaves this
        // set so the worker blocks instead of spinning (see module notes).
        let mut asked = false;

        loop {
            // Handle anything already inbound (a pending mode switch in
            // particular) before committing to a new ask.
            if work_mode && !asked && !pipe.readable_now() {
                pipe.send_tag(W2Q::Dequeue);
                pipe.flush()?;
                asked = true;
            }

            match pipe.recv_tag::<Q2W>()? {
                Q2W::Terminate => return Ok(()),

                Q2W::SwitchWorkMode => {
                    work_mode = !work_mode;
                    asked = false;
                }

                Q2W::DequeueAccepted => {
                    let job_id = pipe.recv_u64()? as usize;
                    let task = pipe.recv_u64()? as usize;
                    if !work_mode {
                        // Stale acknowledgement from a mode boundary; the
                        // payload is consumed to keep framing intact.
                        warn!("dequeue_accepted for task {task} arrived in idle mode; dropped");
                        asked = false;
                        continue;
                    }
                    asked = false;
                    let job = self.job(job_id)?;
                    job.evaluate_task(task)?;
                    pipe.send_tag(W2Q::SendResult);
                    pipe.send_u64(job_id as u64);
                    pipe.send_u64(task as u64);
                    pipe.send_blob(&job.task_result_bytes(task));
                    pipe.flush()?;
                    pipe.expect_tag(Q2W::ResultReceived, "Q2W::ResultReceived")?;
                }

                Q2W::DequeueRejected => {
                    if !work_mode {
                        // Stale acknowledgement; nothing to do.
                        asked = false;
                    }
                    // In work mode: queue drained; block on the next
                    // message (mode switch or terminate) rather than
                    // re-asking.
                }

                Q2W::UpdateReal => {
                    let job_id = pipe.recv_u64()? as usize;
                    let ix = pipe.recv_u64()? as usize;
                    let val = pipe.recv_f64()?;
                    let is_const = pipe.recv_bool()?;
                    if work_mode {
                        warn!("update_real received in work mode; applying anyway");
                    }
                    self.job(job_id)?.update_real(ix, val, is_const);
                }

                Q2W::CallDoubleConstMethod => {
                    let job_id = pipe.recv_u64()? as usize;
                    let key_bytes = pipe.recv_blob()?;
                    let key = String::from_utf8_lossy(&key_bytes);
                    let result = self.job(job_id)?.call_double_const_method(&key)?;
                    pipe.send_f64(result);
                    pipe.flush()?;
                }

                Q2W::ResultReceived => {
                    warn!("result_received outside its handshake; ignored");
                }
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        // The last job's detach normally tears down first; this covers a
        // manager dropped with jobs still registered.
        self.terminate();
    }
}
