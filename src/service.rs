//! Domain types for supervised services: the immutable resolved
//! configuration, the per-service mutable runtime state, and the live
//! registry the scheduler and the directory scanner share.

use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Compiled body predicate. Keeps the source string around for the
/// `Body no regex match: <source>` report and the configuration dump.
#[derive(Debug, Clone)]
pub struct BodyPredicate {
    source: String,
    regex: Regex,
}

impl BodyPredicate {
    pub fn compile(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// First match in `body`, if any.
    pub fn find<'b>(&self, body: &'b str) -> Option<&'b str> {
        self.regex.find(body).map(|m| m.as_str())
    }
}

impl Serialize for BodyPredicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

/// An HTTP call fired by an action: index 0 on recovery, index 1 on
/// failure (a single entry is the failure hook).
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpHook {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
}

/// What to do on a health transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Action {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cmd: String,
    /// Space-separated recipient list, the literal `yes` (use the global
    /// `to` header), or empty for no email.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notify: String,
    /// `msg[0]` on recovery, `msg[1]` on failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub msg: Vec<String>,
    /// Hex code points prepended to the subject; `"0"` disables both.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emoji: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpHook>,
}

/// Consecutive-count notification gates.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Threshold {
    pub healthy: u32,
    pub unhealthy: u32,
}

/// The predicate set applied to a probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Expect {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyPredicate>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    /// Certificate-expiry alert window.
    #[serde(serialize_with = "serialize_secs", rename = "ssl_seconds")]
    pub ssl_every: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_not: Option<Action>,
}

impl Default for Expect {
    fn default() -> Self {
        Self {
            status: DEFAULT_EXPECT_STATUS,
            body: None,
            header: BTreeMap::new(),
            ssl_every: DEFAULT_SSL_EVERY,
            if_not: None,
        }
    }
}

pub const DEFAULT_EXPECT_STATUS: u16 = 200;
pub const DEFAULT_EVERY: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_SCAN_EVERY: Duration = Duration::from_secs(300);
/// 72 hours before `not_after`.
pub const DEFAULT_SSL_EVERY: Duration = Duration::from_secs(259_200);
/// Never skip the action command.
pub const DEFAULT_STOP: i64 = -1;

/// Mutable runtime state, serialized per service under its mutex.
#[derive(Debug, Default)]
pub struct ServiceState {
    /// Consecutive failures; 0 means the last check was healthy.
    pub failures: u32,
    /// Consecutive successes since the last failure.
    pub healthy_streak: u32,
    /// Retries consumed by the most recent probe.
    pub retries: u32,
    /// Action fired on transition-to-unhealthy, stashed so the recovery
    /// notice reaches the same audience.
    pub recovery_action: Option<Action>,
}

/// A supervised unit: resolved configuration plus runtime state.
#[derive(Debug, Serialize)]
pub struct Service {
    #[serde(skip)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(serialize_with = "serialize_secs", rename = "every_seconds")]
    pub every: Duration,
    #[serde(serialize_with = "serialize_secs", rename = "timeout_seconds")]
    pub timeout: Duration,
    pub follow: bool,
    pub insecure: bool,
    pub disable: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    /// Maximum response-body bytes to read; 0 = unbounded.
    pub read_limit: u64,
    #[serde(serialize_with = "serialize_millis", rename = "retry_interval_ms")]
    pub retry_interval: Duration,
    pub retry_limit: u32,
    /// Maximum consecutive failures before the action command is skipped;
    /// -1 = never skip.
    pub stop: i64,
    pub threshold: Threshold,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    pub expect: Expect,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub if_status: BTreeMap<u16, Action>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub if_header: BTreeMap<String, Action>,
    /// Prebuilt per-service HTTP client; `None` for shell-test probes.
    #[serde(skip)]
    pub client: Option<reqwest::Client>,
    #[serde(skip)]
    pub state: Mutex<ServiceState>,
    /// Overlapping-tick guard: a tick is dropped while the previous one
    /// for the same service is still running.
    #[serde(skip)]
    pub in_flight: AtomicBool,
}

impl Service {
    /// True when the anti-flap gate must suppress the action command,
    /// given the failure count including the current tick.
    pub fn skips_cmd(&self, failures_now: u32) -> bool {
        self.stop != -1 && i64::from(failures_now) > self.stop
    }
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// The live service map. The scanner mutates it under the write lock;
/// everything else takes read snapshots.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.read().expect("service registry poisoned").get(name).cloned()
    }

    /// Install or replace a service. A replaced service hands its
    /// `failures` count and pending recovery action to the replacement;
    /// everything else comes from the new definition.
    pub fn upsert(&self, service: Service) -> Arc<Service> {
        let mut guard = self.inner.write().expect("service registry poisoned");
        if let Some(previous) = guard.get(&service.name) {
            let old = previous.state.lock().expect("service state poisoned");
            let mut fresh = service.state.lock().expect("service state poisoned");
            fresh.failures = old.failures;
            fresh.recovery_action = old.recovery_action.clone();
            drop(fresh);
        }
        let service = Arc::new(service);
        guard.insert(service.name.clone(), Arc::clone(&service));
        service
    }

    /// Services sorted by name, for banners and the runtime dump.
    pub fn snapshot(&self) -> Vec<Arc<Service>> {
        let guard = self.inner.read().expect("service registry poisoned");
        let mut services: Vec<_> = guard.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("service registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for ServiceRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let services = self.snapshot();
        let mut map = serializer.serialize_map(Some(services.len()))?;
        for service in services {
            map.serialize_entry(&service.name, service.as_ref())?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            url: Some("http://localhost/check".to_string()),
            test: None,
            every: DEFAULT_EVERY,
            timeout: DEFAULT_TIMEOUT,
            follow: false,
            insecure: false,
            disable: false,
            header: BTreeMap::new(),
            read_limit: 0,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_limit: DEFAULT_RETRY_LIMIT,
            stop: DEFAULT_STOP,
            threshold: Threshold::default(),
            log: None,
            expect: Expect::default(),
            if_status: BTreeMap::new(),
            if_header: BTreeMap::new(),
            client: None,
            state: Mutex::new(ServiceState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    #[test]
    fn skip_gate_uses_current_failure_count() {
        let mut service = bare_service("s6");
        service.stop = 2;
        assert!(!service.skips_cmd(1));
        assert!(!service.skips_cmd(2));
        assert!(service.skips_cmd(3));

        service.stop = -1;
        assert!(!service.skips_cmd(100));

        service.stop = 0;
        assert!(service.skips_cmd(1));
    }

    #[test]
    fn upsert_preserves_failures_and_recovery_action() {
        let registry = ServiceRegistry::default();
        let first = registry.upsert(bare_service("web"));
        {
            let mut state = first.state.lock().unwrap();
            state.failures = 3;
            state.healthy_streak = 0;
            state.recovery_action = Some(Action {
                notify: "ops@example.com".to_string(),
                ..Action::default()
            });
        }

        let mut redefined = bare_service("web");
        redefined.expect.status = 503;
        let replaced = registry.upsert(redefined);

        let state = replaced.state.lock().unwrap();
        assert_eq!(state.failures, 3);
        assert_eq!(
            state.recovery_action.as_ref().map(|a| a.notify.as_str()),
            Some("ops@example.com")
        );
        assert_eq!(state.healthy_streak, 0);
        assert_eq!(replaced.expect.status, 503);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn body_predicate_reports_match_and_source() {
        let predicate = BodyPredicate::compile("molca[a-z]+").unwrap();
        assert_eq!(predicate.find("hot molcajete sauce"), Some("molcajete"));
        assert_eq!(predicate.find("nothing here"), None);
        assert_eq!(predicate.source(), "molca[a-z]+");
    }
}
