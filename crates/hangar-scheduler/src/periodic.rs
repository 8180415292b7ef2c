//! Periodic background work.
//!
//! A [`Timer`] drives registered works from one tokio task. Synchronous
//! works run inline on that task and must be quick. Asynchronous works run
//! on the blocking pool; if a run is still going when the next one is due,
//! the new run is skipped.

use hangar_core::Result;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Quick work run inline on the timer task.
pub trait PeriodicWork: Send + Sync {
    fn name(&self) -> &str;

    fn recurrence_period(&self) -> Duration;

    /// Defaults to a random point within the first period so works
    /// registered together do not fire together.
    fn initial_delay(&self) -> Duration {
        random_initial_delay(self.recurrence_period())
    }

    fn do_run(&self);
}

/// Slow work run on the blocking pool.
pub trait AsyncPeriodicWork: Send + Sync {
    fn name(&self) -> &str;

    fn recurrence_period(&self) -> Duration;

    fn initial_delay(&self) -> Duration {
        random_initial_delay(self.recurrence_period())
    }

    fn execute(&self) -> Result<()>;
}

/// Uniform in `[0, period)`.
pub fn random_initial_delay(period: Duration) -> Duration {
    let millis = period.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..millis))
}

enum Work {
    Sync(Arc<dyn PeriodicWork>),
    Async {
        work: Arc<dyn AsyncPeriodicWork>,
        running: Arc<AtomicBool>,
    },
}

impl Work {
    fn name(&self) -> &str {
        match self {
            Work::Sync(w) => w.name(),
            Work::Async { work, .. } => work.name(),
        }
    }

    fn period(&self) -> Duration {
        let period = match self {
            Work::Sync(w) => w.recurrence_period(),
            Work::Async { work, .. } => work.recurrence_period(),
        };
        period.max(Duration::from_millis(1))
    }

    fn initial_delay(&self) -> Duration {
        match self {
            Work::Sync(w) => w.initial_delay(),
            Work::Async { work, .. } => work.initial_delay(),
        }
    }

    fn fire(&self) {
        match self {
            Work::Sync(work) => {
                debug!(work = work.name(), "Running periodic work");
                if catch_unwind(AssertUnwindSafe(|| work.do_run())).is_err() {
                    error!(work = work.name(), "Periodic work panicked");
                }
            }
            Work::Async { work, running } => {
                if running.swap(true, Ordering::SeqCst) {
                    info!(work = work.name(), "Previous run is still in progress, skipping");
                    return;
                }
                let work = work.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    let name = work.name().to_string();
                    let started = Instant::now();
                    let job = work.clone();
                    match tokio::task::spawn_blocking(move || job.execute()).await {
                        Ok(Ok(())) => {
                            info!(work = %name, elapsed_ms = started.elapsed().as_millis() as u64, "Finished periodic work")
                        }
                        Ok(Err(e)) => error!(work = %name, error = %e, "Periodic work failed"),
                        Err(e) => error!(work = %name, error = %e, "Periodic work panicked"),
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        }
    }
}

/// Collects periodic works until [`Timer::start`].
#[derive(Default)]
pub struct Timer {
    works: Vec<Work>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, work: Arc<dyn PeriodicWork>) -> &mut Self {
        self.works.push(Work::Sync(work));
        self
    }

    pub fn register_async(&mut self, work: Arc<dyn AsyncPeriodicWork>) -> &mut Self {
        self.works.push(Work::Async {
            work,
            running: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.works.is_empty()
    }

    /// Spawn the timer task.
    pub fn start(self) -> TimerHandle {
        let (tx, rx) = watch::channel(false);
        let names: Vec<&str> = self.works.iter().map(Work::name).collect();
        info!(works = ?names, "Starting timer");
        let task = tokio::spawn(drive(self.works, rx));
        TimerHandle { shutdown: tx, task }
    }
}

/// Running timer.
pub struct TimerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop firing works. Asynchronous runs already started are left to
    /// finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn drive(works: Vec<Work>, mut shutdown: watch::Receiver<bool>) {
    let start = Instant::now();
    let mut due: BinaryHeap<Reverse<(Instant, usize)>> = works
        .iter()
        .enumerate()
        .map(|(i, w)| Reverse((start + w.initial_delay(), i)))
        .collect();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(&Reverse((at, index))) = due.peek() else {
            let _ = shutdown.changed().await;
            break;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(at) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        due.pop();
        let work = &works[index];
        work.fire();
        let next = (at + work.period()).max(Instant::now());
        due.push(Reverse((next, index)));
    }
    debug!("Timer stopped");
}
