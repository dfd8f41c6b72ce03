//! Reporter: builds the per-tick status document, advances the health
//! state machine inside one critical section, decides whether to notify,
//! and ships the document to the log sink.

use crate::dispatch::Direction;
use crate::service::{Action, Service, ServiceState, Threshold};
use crate::supervise::{Engine, Verdict};
use crate::telemetry;
use crate::term;
use chrono::{SecondsFormat, Utc};
use reqwest::header::HeaderMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, error};

/// What one state-machine step decided.
#[derive(Debug)]
pub(crate) struct TickDecision {
    pub direction: Direction,
    pub notify: bool,
    /// The action notifications go to: the verdict's on failure, the
    /// stashed recovery action on recovery.
    pub action: Option<Action>,
    /// Consecutive failures after this tick.
    pub failures: u32,
}

/// Advance the counters for one evaluated tick and work out the notify
/// decision. Runs under the service state lock.
pub(crate) fn apply_tick(
    state: &mut ServiceState,
    threshold: Threshold,
    exit: i32,
    action: Option<Action>,
    retries: u32,
) -> TickDecision {
    state.retries = retries;

    if exit == 0 {
        state.failures = 0;
        state.healthy_streak += 1;
        let pending = state.recovery_action.clone();
        let notify = pending.is_some()
            && (threshold.healthy == 0 || state.healthy_streak == threshold.healthy);
        if notify {
            state.recovery_action = None;
        }
        TickDecision {
            direction: Direction::Recovery,
            notify,
            action: pending,
            failures: 0,
        }
    } else {
        state.failures += 1;
        state.healthy_streak = 0;
        let notify = (state.failures == 1 && threshold.unhealthy <= 1)
            || state.failures == threshold.unhealthy;
        if notify {
            state.recovery_action = action.clone();
        }
        TickDecision {
            direction: Direction::Failure,
            notify,
            action,
            failures: state.failures,
        }
    }
}

impl Engine {
    /// Finish one tick: update state, emit the document, notify.
    pub async fn report(
        &self,
        service: &Arc<Service>,
        verdict: Verdict,
        output: String,
        retries: u32,
        headers: Option<HeaderMap>,
    ) {
        let decision = {
            let mut state = service.state.lock().expect("service state poisoned");
            apply_tick(
                &mut state,
                service.threshold,
                verdict.exit,
                verdict.action.clone(),
                retries,
            )
        };

        match decision.direction {
            Direction::Recovery => telemetry::runtime_counters().inc_ticks_healthy(),
            Direction::Failure => telemetry::runtime_counters().inc_ticks_unhealthy(),
        }

        let document = status_document(service, &verdict, &output, retries);

        if self.debug {
            self.echo(service, &decision, &document, headers.as_ref());
        }

        if let Some(log_url) = &service.log {
            match serde_json::to_vec_pretty(&document) {
                Ok(body) => self.dispatcher.post_log(&service.name, log_url, body),
                Err(err) => {
                    error!(service = %service.name, error = %err, "failed to encode status document")
                }
            }
        }

        if decision.notify {
            if let Some(action) = &decision.action {
                self.dispatcher
                    .notify(&service.name, action, decision.direction, &document);
            }
        }
    }

    fn echo(
        &self,
        service: &Arc<Service>,
        decision: &TickDecision,
        document: &JsonMap<String, JsonValue>,
        headers: Option<&HeaderMap>,
    ) {
        let rendered = serde_json::to_string_pretty(document).unwrap_or_default();
        let line = format!("Report: {rendered}, Count: {}", decision.failures);
        let colored = match decision.direction {
            Direction::Recovery => term::green(&line),
            Direction::Failure => term::red(&line),
        };

        let mut dump = String::new();
        if service.url.is_some() {
            if let Some(headers) = headers {
                let mut lines: Vec<String> = headers
                    .iter()
                    .map(|(name, value)| {
                        format!("{name}: {}", value.to_str().unwrap_or_default())
                    })
                    .collect();
                lines.sort();
                dump = term::yellow(&format!("Headers: \n{}\n", lines.join("\n")));
            }
        }

        debug!("{colored}\n{dump}");
    }
}

/// The JSON status document. serde_json's default map keeps keys in
/// lexicographic order, which the mail body and subject templating rely
/// on.
pub fn status_document(
    service: &Service,
    verdict: &Verdict,
    output: &str,
    retries: u32,
) -> JsonMap<String, JsonValue> {
    let mut document = JsonMap::new();
    document.insert("name".to_string(), JsonValue::String(service.name.clone()));
    if let Some(url) = &service.url {
        document.insert("url".to_string(), JsonValue::String(url.clone()));
    }
    if let Some(test) = &service.test {
        document.insert("test".to_string(), JsonValue::String(test.clone()));
    }
    document.insert("exit".to_string(), JsonValue::Number(verdict.exit.into()));
    document.insert("status".to_string(), JsonValue::Number(verdict.status.into()));
    if !output.is_empty() {
        document.insert("output".to_string(), JsonValue::String(output.to_string()));
    }
    if !verdict.because.is_empty() {
        document.insert(
            "because".to_string(),
            JsonValue::String(verdict.because.clone()),
        );
    }
    document.insert(
        "when".to_string(),
        JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if retries > 0 {
        document.insert("retries".to_string(), JsonValue::Number(retries.into()));
    }
    document
}
