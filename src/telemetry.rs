//! Tracing setup and process-wide runtime counters.
//!
//! The counters back the SIGUSR1/SIGUSR2 runtime dump: cheap atomics
//! incremented on the hot path, snapshotted on demand.

use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(debug: bool) -> Result<()> {
    let default_directive = if debug { "epazote=debug,info" } else { "epazote=info,warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let stdout_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let writer = stdout
        .with_max_level(stdout_level)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

#[derive(Default)]
pub struct RuntimeCounters {
    ticks_healthy: AtomicU64,
    ticks_unhealthy: AtomicU64,
    ticks_skipped: AtomicU64,
    ticks_panicked: AtomicU64,
    notifications: AtomicU64,
    emails_sent: AtomicU64,
    webhooks_fired: AtomicU64,
    scan_updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RuntimeCountersSnapshot {
    pub ticks_healthy: u64,
    pub ticks_unhealthy: u64,
    pub ticks_skipped: u64,
    pub ticks_panicked: u64,
    pub notifications: u64,
    pub emails_sent: u64,
    pub webhooks_fired: u64,
    pub scan_updates: u64,
}

impl RuntimeCounters {
    pub fn inc_ticks_healthy(&self) {
        self.ticks_healthy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks_unhealthy(&self) {
        self.ticks_unhealthy.fetch_add(1, Ordering::Relaxed);
    }

    /// A tick dropped because the previous one was still running.
    pub fn inc_ticks_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks_panicked(&self) {
        self.ticks_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_emails_sent(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhooks_fired(&self) {
        self.webhooks_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scan_updates(&self) {
        self.scan_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            ticks_healthy: self.ticks_healthy.load(Ordering::Relaxed),
            ticks_unhealthy: self.ticks_unhealthy.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            ticks_panicked: self.ticks_panicked.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            webhooks_fired: self.webhooks_fired.load(Ordering::Relaxed),
            scan_updates: self.scan_updates.load(Ordering::Relaxed),
        }
    }
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}
