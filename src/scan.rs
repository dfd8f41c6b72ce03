//! Directory watcher: walks the configured paths for `epazote.yml`
//! service-definition files and feeds them into the live service set.

use crate::config;
use crate::scheduler::Job;
use crate::supervise::Engine;
use crate::telemetry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

impl Engine {
    /// The recurring scan task for one configured path. Periodic ticks
    /// only consider freshly modified files, so removed services are not
    /// resurrected on every pass.
    pub fn scan_job(self: &Arc<Self>, root: PathBuf, interval: Duration) -> Job {
        let engine = Arc::clone(self);
        Arc::new(move || {
            let engine = Arc::clone(&engine);
            let root = root.clone();
            Box::pin(async move { engine.scan(&root, Some(interval)).await })
        })
    }

    /// Walk `root` and apply every service-definition file found.
    /// `fresh_within` limits the pass to files modified inside the
    /// window; `None` (the startup scan) applies everything.
    pub async fn scan(self: &Arc<Self>, root: &Path, fresh_within: Option<Duration>) {
        if self.debug {
            debug!(path = %root.display(), "starting scan");
        }

        for entry in WalkDir::new(root).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = %root.display(), error = %err, "scan walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().ends_with("epazote.yml") {
                continue;
            }
            if let Some(window) = fresh_within {
                match file_age(entry.path()) {
                    Ok(age) if age > window => continue,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(file = %entry.path().display(), error = %err, "cannot stat definition file");
                        continue;
                    }
                }
            }
            self.apply_service_file(entry.path());
        }
    }

    /// Parse one definition file and install its services. A bad entry
    /// skips only itself; the rest of the file still applies.
    fn apply_service_file(self: &Arc<Self>, path: &Path) {
        let entries = match config::parse_service_file(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping definition file");
                return;
            }
        };

        for (name, raw) in entries {
            let service = match config::resolve_service(&name, raw) {
                Ok(service) => service,
                Err(err) => {
                    warn!(file = %path.display(), service = %name, error = %err, "skipping service");
                    continue;
                }
            };
            // Scanned definitions supervise endpoints; shell tests stay
            // in the startup configuration.
            if service.url.is_none() {
                warn!(file = %path.display(), service = %name, "skipping service without URL");
                continue;
            }
            if self.debug {
                debug!(file = %path.display(), service = %name, "updating/adding service");
            }
            self.install(service);
            telemetry::runtime_counters().inc_scan_updates();
        }
    }
}

fn file_age(path: &Path) -> std::io::Result<Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().unwrap_or_default())
}
