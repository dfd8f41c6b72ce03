//! Action dispatcher: shell commands, email notifications, and HTTP
//! webhooks. Email and webhook failures are logged and swallowed; they
//! never feed back into the health state machine.

use crate::config::SmtpConfig;
use crate::error::Result;
use crate::mailer::{Mailer, SmtpMailer};
use crate::probe::shell::user_shell;
use crate::probe::USER_AGENT;
use crate::service::{Action, HttpHook};
use crate::telemetry;
use crate::term;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, warn};
use url::form_urlencoded;

const CRLF: &str = "\r\n";

/// Default subject emoji: recovery herb, failure pile.
const EMOJI_RECOVERY: &str = "1f33f";
const EMOJI_FAILURE: &str = "1f4a9";

/// Which way the service just transitioned. Recovery selects index 0 of
/// the two-slot message/emoji/webhook lists, failure index 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Recovery,
    Failure,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Recovery => 0,
            Direction::Failure => 1,
        }
    }
}

pub struct ActionDispatcher {
    smtp: SmtpConfig,
    mailer: Option<Arc<dyn Mailer>>,
    http: reqwest::Client,
}

impl ActionDispatcher {
    pub fn new(smtp: SmtpConfig) -> Result<Self> {
        let mailer: Option<Arc<dyn Mailer>> = if smtp.enabled {
            Some(Arc::new(SmtpMailer::from_config(&smtp)?))
        } else {
            None
        };
        Self::assemble(smtp, mailer)
    }

    /// Swap the SMTP transport for a test double.
    pub fn with_mailer(smtp: SmtpConfig, mailer: Arc<dyn Mailer>) -> Result<Self> {
        Self::assemble(smtp, Some(mailer))
    }

    fn assemble(smtp: SmtpConfig, mailer: Option<Arc<dyn Mailer>>) -> Result<Self> {
        // Webhook and log-sink calls follow redirects and skip TLS
        // verification, matching the probe-independent outbound path.
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { smtp, mailer, http })
    }

    /// Run an action's shell command, honoring the anti-flap skip.
    /// Returns the report `output` string.
    pub async fn run_cmd(&self, action: Option<&Action>, skip: bool) -> String {
        if skip {
            return "Skipping cmd".to_string();
        }
        let cmd = action.map(|a| a.cmd.as_str()).unwrap_or_default();
        if cmd.is_empty() {
            return "No defined cmd".to_string();
        }

        match Command::new(user_shell()).arg("-c").arg(cmd).output().await {
            Ok(output) if output.status.success() => {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                String::from_utf8_lossy(&combined).into_owned()
            }
            Ok(output) => match output.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated".to_string(),
            },
            Err(err) => err.to_string(),
        }
    }

    /// Fire the notification channels for a transition: email (when SMTP
    /// is enabled and the action asks for it) and the direction's
    /// webhook. Both are dispatched in their own tasks.
    pub fn notify(
        &self,
        service_name: &str,
        action: &Action,
        direction: Direction,
        document: &JsonMap<String, JsonValue>,
    ) {
        telemetry::runtime_counters().inc_notifications();

        if !action.notify.is_empty() {
            match &self.mailer {
                Some(mailer) => self.send_email(service_name, action, direction, document, mailer),
                None => {
                    warn!("{}", term::red("Can't send email, no SMTP settings found."));
                }
            }
        }

        if let Some(hook) = select_hook(&action.http, direction) {
            self.fire_hook(service_name, hook.clone(), document);
        }
    }

    fn send_email(
        &self,
        service_name: &str,
        action: &Action,
        direction: Direction,
        document: &JsonMap<String, JsonValue>,
        mailer: &Arc<dyn Mailer>,
    ) {
        let to: Vec<String> = if action.notify == "yes" {
            self.smtp
                .header("to")
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            action.notify.split_whitespace().map(str::to_string).collect()
        };

        let mut subject = substitute(self.smtp.header("subject"), document, false);
        if let Some(emoji) = select_emoji(&action.emoji, direction) {
            subject = b_encode(&format!("{emoji}  {subject}"));
        }

        let body = render_body(select_message(&action.msg, direction), document);
        let message = render_message(&self.smtp.headers, &to, &subject, body.as_bytes());

        let mailer = Arc::clone(mailer);
        let service_name = service_name.to_string();
        tokio::spawn(async move {
            match mailer.send(&to, &message).await {
                Ok(()) => telemetry::runtime_counters().inc_emails_sent(),
                Err(err) => {
                    error!(service = %service_name, error = %err, "attempting to send email failed")
                }
            }
        });
    }

    fn fire_hook(&self, service_name: &str, hook: HttpHook, document: &JsonMap<String, JsonValue>) {
        let client = self.http.clone();
        let service_name = service_name.to_string();
        let method = hook.method.to_uppercase();

        let request = if method == "POST" {
            let data = substitute(&hook.data, document, true);
            let mut request = client
                .post(&hook.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(data);
            for (name, value) in &hook.header {
                request = request.header(name, value);
            }
            request
        } else {
            let url = substitute(&hook.url, document, true);
            let mut request = client.get(url);
            for (name, value) in &hook.header {
                request = request.header(name, value);
            }
            request
        };

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    telemetry::runtime_counters().inc_webhooks_fired();
                    let status = response.status();
                    // Drain so the connection is reusable.
                    let body = response.bytes().await.unwrap_or_default();
                    debug!(
                        service = %service_name,
                        url = %hook.url,
                        method = %method,
                        status = status.as_u16(),
                        bytes = body.len(),
                        "webhook dispatched"
                    );
                }
                Err(err) => {
                    error!(service = %service_name, url = %hook.url, error = %err, "webhook failed")
                }
            }
        });
    }

    /// POST the JSON status document to a service's log sink.
    pub fn post_log(&self, service_name: &str, log_url: &str, document: Vec<u8>) {
        let request = self
            .http
            .post(log_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(document);
        let service_name = service_name.to_string();
        let log_url = log_url.to_string();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    let _ = response.bytes().await;
                }
                Err(err) => {
                    error!(service = %service_name, url = %log_url, error = %err, "posting log failed")
                }
            }
        });
    }
}

/// Replace every `_<key>_` with the document's value for `key`,
/// URL-escaped when `escape` is set (webhooks).
pub(crate) fn substitute(
    template: &str,
    document: &JsonMap<String, JsonValue>,
    escape: bool,
) -> String {
    let mut rendered = template.to_string();
    for (key, value) in document {
        let needle = format!("_{key}_");
        if !rendered.contains(&needle) {
            continue;
        }
        let mut text = value_text(value);
        if escape {
            text = form_urlencoded::byte_serialize(text.as_bytes()).collect();
        }
        rendered = rendered.replace(&needle, &text);
    }
    rendered
}

/// Render a JSON value the way it should appear in subjects and bodies:
/// strings bare, everything else in its JSON form.
fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn select_message(msg: &[String], direction: Direction) -> &str {
    msg.get(direction.index()).map(String::as_str).unwrap_or_default()
}

/// Emoji slot for the direction: `"0"` in the first slot disables both, a
/// single value overrides the recovery slot only.
fn select_emoji(emoji: &[String], direction: Direction) -> Option<char> {
    let mut slots = [EMOJI_RECOVERY, EMOJI_FAILURE];
    match emoji {
        [first, ..] if first == "0" => return None,
        [only] => slots[0] = only,
        [first, second, ..] => {
            slots[0] = first;
            slots[1] = second;
        }
        [] => {}
    }
    let slot = slots[direction.index()];
    if slot.is_empty() {
        return None;
    }
    term::icon(slot)
}

/// RFC 2047 B-encoding of a subject line.
fn b_encode(subject: &str) -> String {
    format!("=?UTF-8?B?{}?=", BASE64.encode(subject.as_bytes()))
}

/// First line is the direction's message, then a blank line, then the
/// document as sorted `key: value` lines.
fn render_body(message: &str, document: &JsonMap<String, JsonValue>) -> String {
    let mut body = format!("{message} {CRLF}{CRLF}");
    for (key, value) in document {
        body.push_str(&format!("{key}: {} {CRLF}", value_text(value)));
    }
    body
}

/// Assemble the full message: title-cased headers in sorted order, a
/// blank line, then the base64-encoded body.
fn render_message(
    headers: &BTreeMap<String, String>,
    to: &[String],
    subject: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut message = String::new();
    for (key, value) in headers {
        let line = match key.as_str() {
            "to" => to.join(", "),
            "subject" => subject.trim().to_string(),
            _ => value.trim().to_string(),
        };
        message.push_str(&format!("{}: {line}{CRLF}", title_case(key)));
    }
    message.push_str(CRLF);
    message.push_str(&BASE64.encode(body));
    message.into_bytes()
}

fn title_case(key: &str) -> String {
    key.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn select_hook(hooks: &[HttpHook], direction: Direction) -> Option<&HttpHook> {
    let hook = match hooks {
        [] => return None,
        // A single hook is the failure webhook.
        [only] => match direction {
            Direction::Failure => only,
            Direction::Recovery => return None,
        },
        _ => hooks.get(direction.index())?,
    };
    if hook.url.is_empty() {
        return None;
    }
    Some(hook)
}
