//! YAML configuration loading and validation.
//!
//! Parsing goes through raw serde structs first; validation walks the raw
//! tree collecting every problem into a rendered error list instead of
//! stopping at the first one. Directory-scanner service files share the
//! same per-service resolution path, but there a bad entry is skipped
//! rather than fatal.

use crate::probe::http::build_service_client;
use crate::service::{
    Action, BodyPredicate, Expect, HttpHook, Service, ServiceState, Threshold, DEFAULT_EVERY,
    DEFAULT_EXPECT_STATUS, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_LIMIT, DEFAULT_SCAN_EVERY,
    DEFAULT_SSL_EVERY, DEFAULT_STOP, DEFAULT_TIMEOUT,
};
use lettre::Address;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const TOP_LEVEL_FIELDS: &str = "config, services";

/// A check interval expressed as `{seconds, minutes, hours}`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EverySpec {
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub hours: u64,
}

impl EverySpec {
    /// Resolve to a single duration; the first non-zero unit wins.
    pub fn interval(&self, default: Duration) -> Duration {
        if self.seconds > 0 {
            Duration::from_secs(self.seconds)
        } else if self.minutes > 0 {
            Duration::from_secs(self.minutes * 60)
        } else if self.hours > 0 {
            Duration::from_secs(self.hours * 3600)
        } else {
            default
        }
    }
}

/// SMTP settings for email notifications. `enabled` is derived during
/// validation: emails are silently dropped while it is false.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub enabled: bool,
}

impl SmtpConfig {
    pub fn header(&self, key: &str) -> &str {
        self.headers.get(key).map(String::as_str).unwrap_or_default()
    }
}

/// Directories scanned for service-definition files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanConfig {
    pub paths: Vec<PathBuf>,
    #[serde(rename = "every_seconds", serialize_with = "serialize_secs")]
    pub every: Duration,
}

fn serialize_secs<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

/// The validated top-level configuration.
#[derive(Debug)]
pub struct EpazoteConfig {
    pub smtp: SmtpConfig,
    pub scan: ScanConfig,
    pub services: Vec<Service>,
}

impl EpazoteConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfigFile = serde_yaml::from_str(contents)?;
        Self::from_raw(raw).map_err(ConfigError::Invalid)
    }

    fn from_raw(raw: RawConfigFile) -> Result<Self, ConfigValidationError> {
        let mut errors = Vec::new();

        for key in raw.extra_fields.keys() {
            errors.push(format!(
                "unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let global = raw.config.unwrap_or_default();
        let mut smtp = parse_smtp(global.smtp);
        let scan = parse_scan(global.scan, &mut errors);

        let has_global_to = smtp.headers.contains_key("to");
        let mut services = Vec::new();
        let mut wants_email = false;
        for (name, raw_service) in raw.services.unwrap_or_default() {
            match resolve_service(&name, raw_service) {
                Ok(service) => {
                    wants_email |= service_wants_email(&service);
                    validate_notify_addresses(&service, has_global_to, &mut errors);
                    services.push(service);
                }
                Err(err) => errors.push(format!("service \"{name}\": {err}")),
            }
        }

        if services.is_empty() && scan.paths.is_empty() {
            errors.push("no services to supervise and no paths to scan".to_string());
        }

        resolve_smtp(&mut smtp, wants_email, &mut errors);

        if errors.is_empty() {
            Ok(Self {
                smtp,
                scan,
                services,
            })
        } else {
            Err(ConfigValidationError::new(errors))
        }
    }

    /// Verify that every scan path exists and resolve symlinks, the way
    /// the daemon will see them at scan time.
    pub fn check_scan_paths(&mut self) -> Result<(), ConfigError> {
        for path in &mut self.scan.paths {
            if !path.is_dir() {
                return Err(ConfigError::Invalid(ConfigValidationError::new(vec![
                    format!(
                        "verify that directory {} exists and is readable",
                        path.display()
                    ),
                ])));
            }
            *path = path.canonicalize()?;
        }
        Ok(())
    }
}

/// Parse a service-definition file discovered by the scanner: a bare
/// `name -> service` mapping with no top-level `config` section.
pub fn parse_service_file(path: &Path) -> Result<Vec<(String, RawService)>, ConfigError> {
    let file = File::open(path)?;
    let raw: BTreeMap<String, RawService> = serde_yaml::from_reader(file)?;
    if raw.is_empty() {
        return Err(ConfigError::Invalid(ConfigValidationError::new(vec![
            format!("{}: no services found", path.display()),
        ])));
    }
    Ok(raw.into_iter().collect())
}

/// Resolve one raw service definition: apply defaults, compile the body
/// predicate, validate the URL, and build the probe client.
pub fn resolve_service(name: &str, raw: RawService) -> Result<Service, String> {
    let url = raw.url.filter(|u| !u.trim().is_empty());
    let test = raw
        .test
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    match (&url, &test) {
        (Some(_), Some(_)) => return Err("cannot have both `url` and `test`".to_string()),
        (None, None) => return Err("must have either `url` or `test`".to_string()),
        _ => {}
    }

    if let Some(url) = &url {
        validate_url(url)?;
    }

    let raw_expect = raw.expect.unwrap_or_default();
    let body = match raw_expect.body.as_deref().filter(|b| !b.is_empty()) {
        Some(source) => Some(
            BodyPredicate::compile(source)
                .map_err(|err| format!("invalid body regex {source:?}: {err}"))?,
        ),
        None => None,
    };

    let status = match raw_expect.status {
        Some(status) if status >= 1 => status,
        _ => DEFAULT_EXPECT_STATUS,
    };

    let expect = Expect {
        status,
        body,
        header: raw_expect.header,
        ssl_every: raw_expect
            .ssl
            .and_then(|ssl| ssl.every)
            .map(|every| every.interval(DEFAULT_SSL_EVERY))
            .unwrap_or(DEFAULT_SSL_EVERY),
        if_not: raw_expect.if_not.map(resolve_action),
    };

    let timeout = match raw.timeout {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        _ => DEFAULT_TIMEOUT,
    };

    let retry_interval = match raw.retry_interval {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => DEFAULT_RETRY_INTERVAL,
    };

    let retry_limit = match raw.retry_limit {
        Some(limit) if limit > 0 => limit,
        _ => DEFAULT_RETRY_LIMIT,
    };

    let mut service = Service {
        name: name.to_string(),
        url,
        test,
        every: raw
            .every
            .map(|every| every.interval(DEFAULT_EVERY))
            .unwrap_or(DEFAULT_EVERY),
        timeout,
        follow: raw.follow,
        insecure: raw.insecure,
        disable: raw.disable,
        header: raw.header,
        read_limit: raw.read_limit,
        retry_interval,
        retry_limit,
        stop: raw.stop.unwrap_or(DEFAULT_STOP),
        threshold: Threshold {
            healthy: raw.threshold.healthy,
            unhealthy: raw.threshold.unhealthy,
        },
        log: raw.log.filter(|l| !l.is_empty()),
        expect,
        if_status: raw
            .if_status
            .into_iter()
            .map(|(code, action)| (code, resolve_action(action)))
            .collect(),
        if_header: raw
            .if_header
            .into_iter()
            .map(|(header, action)| (header, resolve_action(action)))
            .collect(),
        client: None,
        state: Mutex::new(ServiceState::default()),
        in_flight: AtomicBool::new(false),
    };

    if let Some(log) = &service.log {
        validate_url(log).map_err(|err| format!("invalid log URL: {err}"))?;
    }

    if service.url.is_some() {
        service.client = Some(
            build_service_client(&service)
                .map_err(|err| format!("failed to build HTTP client: {err}"))?,
        );
    }

    Ok(service)
}

fn resolve_action(raw: RawAction) -> Action {
    Action {
        cmd: raw.cmd,
        notify: raw.notify,
        msg: raw.msg,
        emoji: raw.emoji,
        http: raw
            .http
            .into_iter()
            .map(|hook| HttpHook {
                url: hook.url,
                method: hook.method,
                header: hook.header,
                data: hook.data,
            })
            .collect(),
    }
}

fn validate_url(url: &str) -> Result<(), String> {
    let parsed = Url::parse(url).map_err(|err| format!("{url:?}: {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("{url:?}: scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(format!("{url:?}: missing host"));
    }
    Ok(())
}

fn parse_smtp(raw: Option<RawSmtp>) -> SmtpConfig {
    let raw = raw.unwrap_or_default();
    SmtpConfig {
        server: raw.server,
        port: raw.port.unwrap_or(25),
        username: raw.username,
        password: raw.password,
        headers: raw.headers,
        enabled: false,
    }
}

fn parse_scan(raw: Option<RawScan>, errors: &mut Vec<String>) -> ScanConfig {
    let raw = raw.unwrap_or_default();
    let mut paths = Vec::new();
    for path in raw.paths {
        if path.trim().is_empty() {
            errors.push("scan path must not be empty".to_string());
            continue;
        }
        paths.push(PathBuf::from(path));
    }
    ScanConfig {
        paths,
        every: raw.every.interval(DEFAULT_SCAN_EVERY),
    }
}

fn each_action<'s>(service: &'s Service) -> impl Iterator<Item = &'s Action> {
    service
        .expect
        .if_not
        .iter()
        .chain(service.if_status.values())
        .chain(service.if_header.values())
}

fn service_wants_email(service: &Service) -> bool {
    each_action(service).any(|action| !action.notify.is_empty())
}

fn validate_notify_addresses(service: &Service, has_global_to: bool, errors: &mut Vec<String>) {
    for action in each_action(service) {
        if action.notify.is_empty() {
            continue;
        }
        if action.notify == "yes" {
            if !has_global_to {
                errors.push(format!(
                    "service \"{}\": notify `yes` needs smtp/headers/to to be set",
                    service.name
                ));
            }
            continue;
        }
        for address in action.notify.split_whitespace() {
            if let Err(err) = address.parse::<Address>() {
                errors.push(format!(
                    "service \"{}\": invalid notify address {address:?}: {err}",
                    service.name
                ));
            }
        }
    }
}

/// Apply SMTP defaults and derive the `enabled` flag. The flag is set when
/// a server is configured or any action asks for email, so that services
/// added later through a scan can notify without extra wiring.
fn resolve_smtp(smtp: &mut SmtpConfig, wants_email: bool, errors: &mut Vec<String>) {
    if !wants_email && smtp.server.is_empty() {
        return;
    }

    if smtp.server.is_empty() {
        errors.push("SMTP server required to send email notifications".to_string());
        return;
    }

    let defaults = [
        ("MIME-Version", "1.0".to_string()),
        ("Content-Type", "text/plain; charset=\"utf-8\"".to_string()),
        ("Content-Transfer-Encoding", "base64".to_string()),
        ("from", format!("epazote@{}", local_hostname())),
        ("subject", "[name, because]".to_string()),
    ];
    for (key, value) in defaults {
        smtp.headers.entry(key.to_string()).or_insert(value);
    }

    if let Some(to) = smtp.headers.get("to") {
        for address in to.clone().split_whitespace() {
            if let Err(err) = address.parse::<Address>() {
                errors.push(format!("invalid recipient address {address:?}: {err}"));
            }
        }
    }

    smtp.enabled = true;
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    config: Option<RawGlobal>,
    #[serde(default)]
    services: Option<BTreeMap<String, RawService>>,
    #[serde(default, flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    #[serde(default)]
    smtp: Option<RawSmtp>,
    #[serde(default)]
    scan: Option<RawScan>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSmtp {
    #[serde(default)]
    server: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScan {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(flatten)]
    every: EverySpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawService {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    disable: bool,
    #[serde(default)]
    follow: bool,
    #[serde(default)]
    insecure: bool,
    #[serde(default)]
    header: BTreeMap<String, String>,
    #[serde(default)]
    read_limit: u64,
    #[serde(default)]
    retry_interval: Option<u64>,
    #[serde(default)]
    retry_limit: Option<u32>,
    #[serde(default)]
    stop: Option<i64>,
    #[serde(default)]
    threshold: RawThreshold,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    every: Option<EverySpec>,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    expect: Option<RawExpect>,
    #[serde(default)]
    if_status: BTreeMap<u16, RawAction>,
    #[serde(default)]
    if_header: BTreeMap<String, RawAction>,
}

#[derive(Debug, Default, Deserialize)]
struct RawThreshold {
    #[serde(default)]
    healthy: u32,
    #[serde(default)]
    unhealthy: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawExpect {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    header: BTreeMap<String, String>,
    #[serde(default)]
    ssl: Option<RawSsl>,
    #[serde(default)]
    if_not: Option<RawAction>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSsl {
    #[serde(default)]
    every: Option<EverySpec>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAction {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    notify: String,
    #[serde(default)]
    msg: Vec<String>,
    #[serde(default)]
    emoji: Vec<String>,
    #[serde(default)]
    http: Vec<RawHttpHook>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttpHook {
    #[serde(default)]
    url: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    header: BTreeMap<String, String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(ConfigValidationError),
}

#[derive(Debug, Error)]
#[error("configuration validation failed:\n{rendered}")]
pub struct ConfigValidationError {
    rendered: String,
}

impl ConfigValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { rendered }
    }
}
