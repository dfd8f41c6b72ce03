//! Named recurring tasks. Each task ticks on its own timer and fires its
//! job in a fresh tokio task, so a slow tick never delays the next one;
//! serialization, where needed, belongs to the job itself.

use crate::telemetry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A zero-argument job producing one tick's worth of work.
pub type Job = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct TaskEntry {
    token: CancellationToken,
    worker: JoinHandle<()>,
}

/// Task-name keyed scheduler. Adding an existing name replaces the task;
/// the first invocation happens one period after registration.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    /// Tracks spawned job invocations so shutdown can drain them.
    jobs: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, period: Duration, job: Job) {
        let period = period.max(Duration::from_secs(1));
        let token = CancellationToken::new();
        let worker = tokio::spawn(run_task(
            name.to_string(),
            period,
            job,
            token.clone(),
            self.jobs.clone(),
        ));

        let mut tasks = self.tasks.lock().expect("scheduler tasks poisoned");
        if let Some(previous) = tasks.insert(name.to_string(), TaskEntry { token, worker }) {
            previous.token.cancel();
        }
    }

    /// Cancel and remove a task. Returns whether it existed.
    pub fn stop(&self, name: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .expect("scheduler tasks poisoned")
            .remove(name);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task. In-flight job invocations run to completion.
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().expect("scheduler tasks poisoned");
        for (name, entry) in tasks.drain() {
            debug!(task = %name, "stopping scheduled task");
            entry.token.cancel();
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("scheduler tasks poisoned").len()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .expect("scheduler tasks poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Cancel every task, then wait for the tick loops and any in-flight
    /// job invocations to finish.
    pub async fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("scheduler tasks poisoned");
            tasks
                .drain()
                .map(|(name, entry)| {
                    debug!(task = %name, "stopping scheduled task");
                    entry.token.cancel();
                    entry.worker
                })
                .collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        self.jobs.close();
        self.jobs.wait().await;
    }
}

async fn run_task(
    name: String,
    period: Duration,
    job: Job,
    token: CancellationToken,
    jobs: TaskTracker,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let handle = jobs.spawn(job());
                watch_tick(name.clone(), handle);
            }
        }
    }
}

/// A tick is fire-and-forget; the watcher only exists to catch a panic at
/// the job boundary and log it with the task name.
fn watch_tick(name: String, handle: JoinHandle<()>) {
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            if err.is_panic() {
                telemetry::runtime_counters().inc_ticks_panicked();
                warn!(task = %name, error = %err, "scheduled tick panicked; waiting for the next one");
            }
        }
    });
}
