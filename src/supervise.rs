//! The supervision engine: one tick runs probe → predicate → report.

use crate::dispatch::ActionDispatcher;
use crate::probe::{http, shell, ProbeOutcome};
use crate::scheduler::{Job, Scheduler};
use crate::service::{Action, Service, ServiceRegistry};
use crate::telemetry;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the predicate evaluator decided about one probe outcome.
#[derive(Debug)]
pub struct Verdict {
    /// 0 healthy, 1 unhealthy.
    pub exit: i32,
    /// HTTP status, or 0 for probe errors and shell tests.
    pub status: u16,
    pub because: String,
    /// Action to invoke when unhealthy; `None` on healthy outcomes or
    /// when the configuration supplies none.
    pub action: Option<Action>,
}

impl Verdict {
    fn healthy(status: u16, because: String) -> Self {
        Self {
            exit: 0,
            status,
            because,
            action: None,
        }
    }

    fn unhealthy(status: u16, because: String, action: Option<&Action>) -> Self {
        Self {
            exit: 1,
            status,
            because,
            action: action.cloned(),
        }
    }
}

/// Wires the registry, scheduler and dispatcher together; every scheduled
/// check and every scan tick goes through here.
pub struct Engine {
    pub registry: ServiceRegistry,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: ActionDispatcher,
    pub debug: bool,
}

impl Engine {
    pub fn new(scheduler: Arc<Scheduler>, dispatcher: ActionDispatcher, debug: bool) -> Self {
        Self {
            registry: ServiceRegistry::default(),
            scheduler,
            dispatcher,
            debug,
        }
    }

    /// Put a service under supervision: install it in the registry
    /// (carrying over prior state on redefinition) and (re)register its
    /// scheduler entry. Disabled services only stop their entry.
    pub fn install(self: &Arc<Self>, service: Service) -> Arc<Service> {
        let service = self.registry.upsert(service);
        if service.disable {
            self.scheduler.stop(&service.name);
        } else {
            if self.debug {
                match &service.url {
                    Some(url) => info!(service = %service.name, url = %url, "adding service"),
                    None => info!(
                        service = %service.name,
                        test = service.test.as_deref().unwrap_or_default(),
                        "adding service"
                    ),
                }
            }
            self.scheduler
                .add(&service.name, service.every, self.supervise_job(Arc::clone(&service)));
        }
        service
    }

    pub fn supervise_job(self: &Arc<Self>, service: Arc<Service>) -> Job {
        let engine = Arc::clone(self);
        Arc::new(move || {
            let engine = Arc::clone(&engine);
            let service = Arc::clone(&service);
            Box::pin(async move { engine.supervise(service).await })
        })
    }

    /// One supervision tick. A tick that finds the previous one still
    /// running drops itself and leaves a counter trail.
    pub async fn supervise(&self, service: Arc<Service>) {
        if service.in_flight.swap(true, Ordering::AcqRel) {
            telemetry::runtime_counters().inc_ticks_skipped();
            debug!(service = %service.name, "previous check still running; dropping tick");
            return;
        }
        let _guard = InFlightGuard(&service.in_flight);

        if service.url.is_some() {
            if let Err(err) = self.check_http(&service).await {
                warn!(service = %service.name, error = %err, "check aborted");
            }
        } else {
            self.check_shell(&service).await;
        }
    }

    async fn check_shell(&self, service: &Arc<Service>) {
        let test = service.test.as_deref().unwrap_or_default();
        if self.debug {
            debug!(service = %service.name, shell = %shell::user_shell(), test, "running test cmd");
        }
        let probe = shell::run_test(test).await;

        let (verdict, output) = if probe.healthy {
            (Verdict::healthy(0, probe.because), String::new())
        } else {
            let verdict = Verdict::unhealthy(0, probe.because, service.expect.if_not.as_ref());
            let output = self.run_action_cmd(service, &verdict).await;
            (verdict, output)
        };
        self.report(service, verdict, output, 0, None).await;
    }

    async fn check_http(&self, service: &Arc<Service>) -> crate::error::Result<()> {
        let probe = http::fetch(service).await?;
        let verdict = evaluate(service, &probe.outcome, Utc::now());

        let output = if verdict.exit != 0 {
            self.run_action_cmd(service, &verdict).await
        } else {
            String::new()
        };

        let headers = match &probe.outcome {
            ProbeOutcome::Response(response) => Some(response.headers.clone()),
            ProbeOutcome::Failed(_) => None,
        };

        self.report(service, verdict, output, probe.retries, headers).await;
        Ok(())
    }

    /// Run the action command for an unhealthy verdict, honoring the
    /// anti-flap gate against the failure count this tick will reach.
    async fn run_action_cmd(&self, service: &Arc<Service>, verdict: &Verdict) -> String {
        let failures_now = {
            let state = service.state.lock().expect("service state poisoned");
            state.failures + 1
        };
        let skip = service.skips_cmd(failures_now);
        self.dispatcher.run_cmd(verdict.action.as_ref(), skip).await
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Apply the predicate set to a probe outcome. First unhealthy match
/// wins; a body predicate is the sole signal when present.
pub fn evaluate(
    service: &Service,
    outcome: &ProbeOutcome,
    now: chrono::DateTime<Utc>,
) -> Verdict {
    let response = match outcome {
        ProbeOutcome::Failed(because) => {
            return Verdict::unhealthy(0, because.clone(), service.expect.if_not.as_ref())
        }
        ProbeOutcome::Response(response) => response,
    };

    if let Some(predicate) = &service.expect.body {
        let body = response.body.as_deref().unwrap_or_default();
        let text = String::from_utf8_lossy(body);
        return match predicate.find(&text) {
            Some(matched) => Verdict::healthy(
                response.status,
                format!("Body regex match: {matched}"),
            ),
            None => Verdict::unhealthy(
                response.status,
                format!("Body no regex match: {}", predicate.source()),
                service.expect.if_not.as_ref(),
            ),
        };
    }

    if let Some(action) = service.if_status.get(&response.status) {
        return Verdict::unhealthy(
            response.status,
            format!("Status: {}", response.status),
            Some(action),
        );
    }

    // Sorted iteration keeps multi-match behavior deterministic: the
    // last matching header's action fires.
    let mut header_hit = None;
    for (name, action) in &service.if_header {
        if !header_value(&response.headers, name).is_empty() {
            header_hit = Some((name, action));
        }
    }
    if let Some((name, action)) = header_hit {
        return Verdict::unhealthy(response.status, format!("Header: {name}"), Some(action));
    }

    if response.status != service.expect.status {
        return Verdict::unhealthy(
            response.status,
            format!("Status: {}", response.status),
            service.expect.if_not.as_ref(),
        );
    }

    for (name, expected) in &service.expect.header {
        if !header_value(&response.headers, name).starts_with(expected.as_str()) {
            return Verdict::unhealthy(
                response.status,
                format!("Header: {name}: {expected}"),
                service.expect.if_not.as_ref(),
            );
        }
    }

    for certificate in &response.certificates {
        if certificate.expires_within(service.expect.ssl_every, now) {
            return Verdict::unhealthy(
                response.status,
                format!(
                    "cert: {} expires in: {}",
                    certificate.common_name,
                    certificate.not_after.to_rfc2822()
                ),
                service.expect.if_not.as_ref(),
            );
        }
    }

    Verdict::healthy(response.status, format!("Status: {}", response.status))
}

fn header_value<'r>(headers: &'r reqwest::header::HeaderMap, name: &str) -> &'r str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tls::CertificateSummary;
    use crate::probe::ProbeResponse;
    use crate::service::{BodyPredicate, ServiceState, Threshold};
    use chrono::Duration as ChronoDuration;
    use reqwest::header::HeaderMap;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            url: Some("http://localhost/health".to_string()),
            test: None,
            every: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            follow: false,
            insecure: false,
            disable: false,
            header: BTreeMap::new(),
            read_limit: 0,
            retry_interval: Duration::from_millis(500),
            retry_limit: 3,
            stop: -1,
            threshold: Threshold::default(),
            log: None,
            expect: crate::service::Expect::default(),
            if_status: BTreeMap::new(),
            if_header: BTreeMap::new(),
            client: None,
            state: Mutex::new(ServiceState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    fn response(status: u16) -> ProbeOutcome {
        ProbeOutcome::Response(ProbeResponse {
            status,
            headers: HeaderMap::new(),
            body: None,
            certificates: Vec::new(),
        })
    }

    fn cmd_action(cmd: &str) -> Action {
        Action {
            cmd: cmd.to_string(),
            ..Action::default()
        }
    }

    #[test]
    fn healthy_when_status_matches() {
        let service = service("s1");
        let verdict = evaluate(&service, &response(200), Utc::now());
        assert_eq!(verdict.exit, 0);
        assert_eq!(verdict.status, 200);
        assert_eq!(verdict.because, "Status: 200");
        assert!(verdict.action.is_none());
    }

    #[test]
    fn probe_error_is_unhealthy_with_if_not() {
        let mut service = service("s1");
        service.expect.if_not = Some(cmd_action("restart"));
        let outcome = ProbeOutcome::Failed("GET: connection refused".to_string());
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.status, 0);
        assert_eq!(verdict.because, "GET: connection refused");
        assert_eq!(verdict.action.unwrap().cmd, "restart");
    }

    #[test]
    fn body_match_reports_the_matched_substring() {
        let mut service = service("s2");
        service.expect.body = Some(
            BodyPredicate::compile(
                "(?i)[a-z0-9]{8}-[a-z0-9]{4}-[1-5][a-z0-9]{3}-[a-z0-9]{4}-[a-z0-9]{12}",
            )
            .unwrap(),
        );
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Some(
                b"Hello, epazote 0BC20225-2E72-4646-9202-8467972199E1 world".to_vec(),
            ),
            certificates: Vec::new(),
        });
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 0);
        assert_eq!(
            verdict.because,
            "Body regex match: 0BC20225-2E72-4646-9202-8467972199E1"
        );
    }

    #[test]
    fn body_predicate_is_the_sole_signal() {
        // Status differs from expect.status, but the body matches: healthy.
        let mut service = service("s2");
        service.expect.body = Some(BodyPredicate::compile("ok").unwrap());
        service.if_status.insert(503, cmd_action("restart"));
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 503,
            headers: HeaderMap::new(),
            body: Some(b"all ok here".to_vec()),
            certificates: Vec::new(),
        });
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 0);
        assert_eq!(verdict.because, "Body regex match: ok");
    }

    #[test]
    fn body_mismatch_names_the_pattern() {
        let mut service = service("s2");
        service.expect.body = Some(BodyPredicate::compile("molcajete").unwrap());
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Some(b"nothing to see".to_vec()),
            certificates: Vec::new(),
        });
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.because, "Body no regex match: molcajete");
    }

    #[test]
    fn if_status_takes_precedence_over_expect_status() {
        let mut service = service("s3");
        service.expect.if_not = Some(cmd_action("fallback"));
        service.if_status.insert(502, cmd_action("true"));
        let verdict = evaluate(&service, &response(502), Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.status, 502);
        assert_eq!(verdict.because, "Status: 502");
        assert_eq!(verdict.action.unwrap().cmd, "true");
    }

    #[test]
    fn if_header_fires_on_presence_and_last_sorted_match_wins() {
        let mut service = service("s");
        service
            .if_header
            .insert("x-alpha".to_string(), cmd_action("alpha"));
        service
            .if_header
            .insert("x-zulu".to_string(), cmd_action("zulu"));

        let mut headers = HeaderMap::new();
        headers.insert("x-alpha", "1".parse().unwrap());
        headers.insert("x-zulu", "1".parse().unwrap());
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers,
            body: None,
            certificates: Vec::new(),
        });

        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.because, "Header: x-zulu");
        assert_eq!(verdict.action.unwrap().cmd, "zulu");
    }

    #[test]
    fn expect_header_uses_prefix_matching() {
        let mut service = service("s");
        service.expect.header.insert(
            "Content-Type".to_string(),
            "application/json".to_string(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Type",
            "application/json; charset=UTF-8".parse().unwrap(),
        );
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers,
            body: None,
            certificates: Vec::new(),
        });
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 0, "prefix must match charset variants");

        let outcome = response(200);
        let verdict = evaluate(&service, &outcome, Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.because, "Header: Content-Type: application/json");
    }

    #[test]
    fn status_mismatch_uses_if_not() {
        let mut service = service("s");
        service.expect.if_not = Some(cmd_action("restart"));
        let verdict = evaluate(&service, &response(500), Utc::now());
        assert_eq!(verdict.exit, 1);
        assert_eq!(verdict.status, 500);
        assert_eq!(verdict.because, "Status: 500");
        assert_eq!(verdict.action.unwrap().cmd, "restart");
    }

    #[test]
    fn certificate_inside_the_expiry_window_is_unhealthy() {
        let now = Utc::now();
        let service = service("s");
        let not_after = now + ChronoDuration::hours(24);
        let outcome = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: None,
            certificates: vec![CertificateSummary {
                common_name: "web.example.com".to_string(),
                not_after,
            }],
        });
        let verdict = evaluate(&service, &outcome, now);
        assert_eq!(verdict.exit, 1);
        assert_eq!(
            verdict.because,
            format!("cert: web.example.com expires in: {}", not_after.to_rfc2822())
        );

        let healthy_cert = ProbeOutcome::Response(ProbeResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: None,
            certificates: vec![CertificateSummary {
                common_name: "web.example.com".to_string(),
                not_after: now + ChronoDuration::days(90),
            }],
        });
        let verdict = evaluate(&service, &healthy_cert, now);
        assert_eq!(verdict.exit, 0);
    }
}
