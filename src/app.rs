//! Application lifecycle: seed the scheduler, run the startup scans,
//! then block on signals until shutdown.

use crate::config::{EpazoteConfig, ScanConfig};
use crate::dispatch::ActionDispatcher;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::service::Service;
use crate::supervise::Engine;
use crate::telemetry;
use crate::term;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct EpazoteApp {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    scan: ScanConfig,
    started: DateTime<Utc>,
}

impl EpazoteApp {
    pub fn initialise(config: EpazoteConfig, debug: bool) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new());
        let dispatcher = ActionDispatcher::new(config.smtp.clone())?;
        let engine = Arc::new(Engine::new(Arc::clone(&scheduler), dispatcher, debug));

        for service in config.services {
            engine.install(service);
        }

        Ok(Self {
            engine,
            scheduler,
            scan: config.scan,
            started: Utc::now(),
        })
    }

    /// Register the scan tasks, run one immediate scan per path, log the
    /// startup banner, then wait for a termination signal. SIGUSR1 and
    /// SIGUSR2 dump the live configuration and runtime statistics.
    pub async fn run(self) -> Result<()> {
        for path in &self.scan.paths {
            self.scheduler.add(
                &path.display().to_string(),
                self.scan.every,
                self.engine.scan_job(path.clone(), self.scan.every),
            );
            self.engine.scan(path, None).await;
        }

        let paths: Vec<String> = self
            .scan
            .paths
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        info!(
            "Epazote {}   on {} services, scan paths: {} [pid: {}]",
            term::icon("1f33f").unwrap_or(' '),
            self.engine.registry.len(),
            paths.join(","),
            std::process::id()
        );

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sigusr1.recv() => self.dump_runtime(),
                _ = sigusr2.recv() => self.dump_runtime(),
            }
        }

        info!("termination signal received");
        self.scheduler.shutdown().await;
        info!("exiting");
        Ok(())
    }

    fn dump_runtime(&self) {
        let services = serde_yaml::to_string(&self.engine.registry).unwrap_or_default();
        let counters = telemetry::runtime_counters().snapshot();
        let uptime = Utc::now() - self.started;
        let stats = format!(
            "\n    Tasks: {}\n    Healthy ticks: {}\n    Unhealthy ticks: {}\n    Skipped ticks: {}\n    Panicked ticks: {}\n    Notifications: {}\n    Emails sent: {}\n    Webhooks fired: {}\n    Scan updates: {}\n    Started on: {}\n    Uptime: {}s",
            self.scheduler.task_count(),
            counters.ticks_healthy,
            counters.ticks_unhealthy,
            counters.ticks_skipped,
            counters.ticks_panicked,
            counters.notifications,
            counters.emails_sent,
            counters.webhooks_fired,
            counters.scan_updates,
            self.started.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime.num_seconds()
        );
        info!("Config dump:\n{services}---{}", term::green(&stats));
    }
}

/// Reachability check for every configured URL, run before the daemon
/// starts: we can't supervise unreachable services. Returns the failures
/// so the caller can decide between fatal and warning (`-c`).
pub async fn verify_services(services: &[Service]) -> Vec<(String, String)> {
    let mut checks = JoinSet::new();
    for service in services {
        let (Some(url), Some(client)) = (&service.url, &service.client) else {
            continue;
        };
        let name = service.name.clone();
        let url = url.clone();
        let client = client.clone();
        checks.spawn(async move {
            match client.get(&url).send().await {
                Ok(_) => None,
                Err(err) => Some((name, err.to_string())),
            }
        });
    }

    let mut failures = Vec::new();
    while let Some(result) = checks.join_next().await {
        match result {
            Ok(Some(failure)) => failures.push(failure),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "URL verification task failed"),
        }
    }
    failures.sort();
    failures
}
