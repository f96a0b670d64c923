//! Background job scheduler.
//!
//! One driver task ticks at the shortest job interval. On every tick the
//! jobs that are due run one after another, in the order they were
//! registered, so a ping sweep registered before room reconciliation always
//! runs first when both are due. A failing job is logged and rescheduled.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Error returned by a job run.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Shortest tick the driver uses, whatever the job intervals.
const MIN_TICK: Duration = Duration::from_millis(10);

/// A periodic unit of work.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    fn run(&self) -> impl Future<Output = Result<(), JobError>> + Send;
}

/// Object-safe wrapper for the Job trait.
trait JobDyn: Send + Sync {
    fn name_dyn(&self) -> &str;
    fn interval_dyn(&self) -> Duration;
    fn run_dyn(&self) -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + '_>>;
}

impl<T: Job> JobDyn for T {
    fn name_dyn(&self) -> &str {
        self.name()
    }
    fn interval_dyn(&self) -> Duration {
        self.interval()
    }
    fn run_dyn(&self) -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + '_>> {
        Box::pin(self.run())
    }
}

struct ScheduledJob {
    job: Box<dyn JobDyn>,
    next_due: Instant,
    runs: u64,
    failures: u64,
}

/// Runs registered jobs on their intervals until shut down.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

/// Handle to a started scheduler.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Scheduler>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Jobs run in registration order; the first run is one
    /// interval after start.
    pub fn register<J: Job + 'static>(&mut self, job: J) {
        info!("Scheduling job {} every {:?}", job.name(), job.interval());
        let next_due = Instant::now() + job.interval();
        self.jobs.push(ScheduledJob {
            job: Box::new(job),
            next_due,
            runs: 0,
            failures: 0,
        });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.job.name_dyn()).collect()
    }

    /// `(runs, failures)` of the named job.
    pub fn stats(&self, name: &str) -> Option<(u64, u64)> {
        self.jobs
            .iter()
            .find(|j| j.job.name_dyn() == name)
            .map(|j| (j.runs, j.failures))
    }

    fn tick_period(&self) -> Duration {
        self.jobs
            .iter()
            .map(|j| j.job.interval_dyn())
            .min()
            .unwrap_or(Duration::from_secs(1))
            .max(MIN_TICK)
    }

    /// Run every job due at `now`, in registration order. Returns how many ran.
    pub async fn run_due(&mut self, now: Instant) -> usize {
        let mut ran = 0;
        for scheduled in &mut self.jobs {
            if now < scheduled.next_due {
                continue;
            }
            let name = scheduled.job.name_dyn().to_string();
            debug!("Running job {}", name);
            scheduled.runs += 1;
            if let Err(e) = scheduled.job.run_dyn().await {
                scheduled.failures += 1;
                warn!("Job {} failed: {}", name, e);
            }
            scheduled.next_due = now + scheduled.job.interval_dyn();
            ran += 1;
        }
        ran
    }

    /// Spawn the driver loop.
    pub fn start(mut self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.tick_period();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Scheduler shutting down");
                            break;
                        }
                    }
                    tick = ticker.tick() => {
                        self.run_due(tick).await;
                    }
                }
            }
            self
        });

        SchedulerHandle { shutdown_tx, handle }
    }
}

impl SchedulerHandle {
    /// Stop the driver after the job currently running, and get the
    /// scheduler back.
    pub async fn stop(self) -> Option<Scheduler> {
        let _ = self.shutdown_tx.send(true);
        match self.handle.await {
            Ok(scheduler) => {
                info!("Scheduler stopped");
                Some(scheduler)
            }
            Err(e) => {
                warn!("Scheduler task ended abnormally: {}", e);
                None
            }
        }
    }
}
