//! The worker pool and the two-phase step protocol.
//!
//! Each worker thread owns a fixed, disjoint set of compartments for the
//! lifetime of the pool. One step runs as follows:
//!
//! 1. The control thread sends every worker a step job.
//! 2. Each worker runs the local phase of its compartments and posts their
//!    departures into the shared [`Mailboxes`].
//! 3. All workers meet at a [`Barrier`]; no exchange phase starts before
//!    every local phase has finished.
//! 4. Each worker runs the exchange phase of its compartments and reports
//!    back.
//!
//! [`ThreadScheduler::run_step`] returns once every worker has reported, so
//! after it returns the world is consistent and can be read or edited.
//! Resharding means draining the compartments and building a new pool.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use protocell_genome::InstructionTable;
use protocell_types::{CompartmentId, SimulationParameters};
use protocell_world::{Compartment, CompartmentGraph, Mailboxes, StepContext, StepReport, WorldError};

use crate::error::SchedulerError;

/// Everything a step reads, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct StepInput {
    /// Partition of the world.
    pub graph: CompartmentGraph,
    /// Parameters for the step.
    pub params: SimulationParameters,
    /// Opcode table.
    pub table: Arc<dyn InstructionTable>,
}

enum Job {
    Step(Arc<StepInput>),
    Shutdown,
}

struct WorkerReport {
    thread: usize,
    results: Vec<(CompartmentId, Result<StepReport, WorldError>)>,
}

struct Worker {
    jobs: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

type Shared = Arc<Vec<Mutex<Compartment>>>;

fn lock(compartment: &Mutex<Compartment>) -> MutexGuard<'_, Compartment> {
    compartment.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fixed pool of worker threads driving compartments step by step.
pub struct ThreadScheduler {
    thread_count: usize,
    pending: BTreeMap<CompartmentId, (Compartment, usize)>,
    compartments: Shared,
    owners: Vec<usize>,
    mailboxes: Arc<Mailboxes>,
    workers: Vec<Worker>,
    reports: Option<Receiver<WorkerReport>>,
}

impl core::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("thread_count", &self.thread_count)
            .field("compartments", &self.compartments.len())
            .field("pending", &self.pending.len())
            .field("launched", &self.is_launched())
            .finish()
    }
}

impl ThreadScheduler {
    /// Create an idle pool of `thread_count` workers.
    pub fn new(thread_count: usize) -> Result<Self, SchedulerError> {
        if thread_count == 0 {
            return Err(SchedulerError::NoThreads);
        }
        Ok(Self {
            thread_count,
            pending: BTreeMap::new(),
            compartments: Arc::new(Vec::new()),
            owners: Vec::new(),
            mailboxes: Arc::new(Mailboxes::default()),
            workers: Vec::new(),
            reports: None,
        })
    }

    /// Worker threads in the pool.
    pub const fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Whether the workers are running.
    pub fn is_launched(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Assign `compartment` to worker `owner_thread` for the pool's lifetime.
    pub fn register_compartment(
        &mut self,
        compartment: Compartment,
        owner_thread: usize,
    ) -> Result<(), SchedulerError> {
        if self.is_launched() {
            return Err(SchedulerError::AlreadyLaunched);
        }
        if owner_thread >= self.thread_count {
            return Err(SchedulerError::InvalidThread {
                thread: owner_thread,
                threads: self.thread_count,
            });
        }
        let id = compartment.id();
        if self.pending.contains_key(&id) {
            return Err(SchedulerError::AlreadyRegistered(id));
        }
        self.pending.insert(id, (compartment, owner_thread));
        Ok(())
    }

    /// Start the workers. Registered ids must be exactly `0..n`.
    pub fn launch(&mut self) -> Result<(), SchedulerError> {
        if self.is_launched() {
            return Err(SchedulerError::AlreadyLaunched);
        }
        for (expected, id) in self.pending.keys().enumerate() {
            if id.0 != expected {
                return Err(SchedulerError::Unregistered(CompartmentId(expected)));
            }
        }
        let pending = std::mem::take(&mut self.pending);
        let mut compartments = Vec::with_capacity(pending.len());
        let mut owners = Vec::with_capacity(pending.len());
        for (compartment, owner) in pending.into_values() {
            compartments.push(Mutex::new(compartment));
            owners.push(owner);
        }
        self.compartments = Arc::new(compartments);
        self.mailboxes = Arc::new(Mailboxes::new(owners.len()));
        self.owners = owners;

        let barrier = Arc::new(Barrier::new(self.thread_count));
        let (report_tx, report_rx) = mpsc::channel();
        for thread in 0..self.thread_count {
            let owned: Vec<usize> = self
                .owners
                .iter()
                .enumerate()
                .filter(|(_, owner)| **owner == thread)
                .map(|(index, _)| index)
                .collect();
            let (job_tx, job_rx) = mpsc::channel();
            let context = WorkerContext {
                thread,
                owned,
                compartments: Arc::clone(&self.compartments),
                mailboxes: Arc::clone(&self.mailboxes),
                barrier: Arc::clone(&barrier),
                reports: report_tx.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("protocell-worker-{thread}"))
                .spawn(move || context.run(&job_rx));
            let handle = match handle {
                Ok(handle) => handle,
                Err(source) => {
                    self.shutdown();
                    return Err(SchedulerError::Spawn { source });
                }
            };
            self.workers.push(Worker {
                jobs: job_tx,
                handle: Some(handle),
            });
        }
        self.reports = Some(report_rx);
        info!(
            threads = self.thread_count,
            compartments = self.compartments.len(),
            "Worker pool launched"
        );
        Ok(())
    }

    /// Run one full step across all compartments and block until it is
    /// complete. Reports are returned in compartment id order.
    pub fn run_step(
        &mut self,
        input: &Arc<StepInput>,
    ) -> Result<Vec<(CompartmentId, StepReport)>, SchedulerError> {
        let Some(reports) = self.reports.as_ref() else {
            return Err(SchedulerError::NotLaunched);
        };
        for (thread, worker) in self.workers.iter().enumerate() {
            if worker.jobs.send(Job::Step(Arc::clone(input))).is_err() {
                return Err(SchedulerError::WorkerLost(thread));
            }
        }
        let mut results = Vec::with_capacity(self.compartments.len());
        for _ in 0..self.workers.len() {
            let report = reports.recv().map_err(|_| SchedulerError::Disconnected)?;
            debug!(thread = report.thread, compartments = report.results.len(), "Worker reported");
            results.extend(report.results);
        }
        results.sort_by_key(|(id, _)| *id);
        let mut out = Vec::with_capacity(results.len());
        for (compartment, result) in results {
            match result {
                Ok(report) => out.push((compartment, report)),
                Err(source) => {
                    return Err(SchedulerError::Compartment {
                        compartment,
                        source,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Number of compartments under management.
    pub fn compartment_count(&self) -> usize {
        self.compartments.len().saturating_add(self.pending.len())
    }

    /// Owner thread of a compartment after launch.
    pub fn owner_of(&self, id: CompartmentId) -> Option<usize> {
        self.owners.get(id.0).copied()
    }

    /// Call `f` on every compartment in id order. Only valid between steps.
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut Compartment)) {
        for compartment in self.compartments.iter() {
            f(&mut lock(compartment));
        }
    }

    /// Map every compartment in id order. Only valid between steps.
    pub fn map<T>(&self, mut f: impl FnMut(&Compartment) -> T) -> Vec<T> {
        self.compartments.iter().map(|c| f(&lock(c))).collect()
    }

    /// Run `f` on one compartment.
    pub fn with_compartment<T>(
        &self,
        id: CompartmentId,
        f: impl FnOnce(&mut Compartment) -> T,
    ) -> Option<T> {
        self.compartments.get(id.0).map(|c| f(&mut lock(c)))
    }

    /// Stop the workers and hand back every compartment, in id order.
    pub fn into_compartments(mut self) -> Vec<Compartment> {
        self.shutdown();
        let shared = std::mem::take(&mut self.compartments);
        let mut out: Vec<Compartment> = std::mem::take(&mut self.pending)
            .into_values()
            .map(|(c, _)| c)
            .collect();
        match Arc::try_unwrap(shared) {
            Ok(compartments) => out.extend(
                compartments
                    .into_iter()
                    .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner)),
            ),
            Err(_) => warn!("Compartments still shared after shutdown"),
        }
        out.sort_by_key(Compartment::id);
        out
    }

    fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.jobs.send(Job::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!("Worker thread panicked");
                }
            }
        }
        self.workers.clear();
        self.reports = None;
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WorkerContext {
    thread: usize,
    owned: Vec<usize>,
    compartments: Shared,
    mailboxes: Arc<Mailboxes>,
    barrier: Arc<Barrier>,
    reports: Sender<WorkerReport>,
}

impl WorkerContext {
    fn run(self, jobs: &Receiver<Job>) {
        while let Ok(Job::Step(input)) = jobs.recv() {
            let report = self.step(&input);
            if self.reports.send(report).is_err() {
                break;
            }
        }
    }

    fn step(&self, input: &StepInput) -> WorkerReport {
        let ctx = StepContext {
            graph: &input.graph,
            params: &input.params,
            table: input.table.as_ref(),
        };
        let mut failures: BTreeMap<usize, WorldError> = BTreeMap::new();
        for &index in &self.owned {
            let Some(compartment) = self.compartments.get(index) else {
                continue;
            };
            let mut compartment = lock(compartment);
            if let Err(err) = compartment.local_phase(&ctx) {
                failures.insert(index, err);
            }
            compartment.post_outbound(&self.mailboxes);
        }

        self.barrier.wait();

        let mut results = Vec::with_capacity(self.owned.len());
        for &index in &self.owned {
            let Some(compartment) = self.compartments.get(index) else {
                continue;
            };
            let mut compartment = lock(compartment);
            compartment.exchange_phase(&self.mailboxes);
            let report = compartment.take_report();
            let result = failures.remove(&index).map_or(Ok(report), Err);
            results.push((compartment.id(), result));
        }
        WorkerReport {
            thread: self.thread,
            results,
        }
    }
}

/// Owner thread for compartment `index` when `count` compartments are split
/// into contiguous blocks over `threads` workers.
pub fn block_owner(index: usize, count: usize, threads: usize) -> usize {
    if count == 0 || threads == 0 {
        return 0;
    }
    index
        .saturating_mul(threads)
        .checked_div(count)
        .unwrap_or(0)
        .min(threads.saturating_sub(1))
}
