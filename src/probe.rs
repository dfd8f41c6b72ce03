//! Probes observe a service's live state: one HTTP fetch (with bounded
//! retries and an optional TLS chain snapshot) or one shell test.

pub mod http;
pub mod shell;
pub mod tls;

use reqwest::header::HeaderMap;

/// User agent sent on every outbound request unless overridden by the
/// service's own headers.
pub const USER_AGENT: &str = "epazote";

/// Normalized snapshot of a successful HTTP fetch.
#[derive(Debug)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Present only when a body predicate or read limit asked for it.
    pub body: Option<Vec<u8>>,
    /// Peer chain summaries for https probes; empty when unavailable.
    pub certificates: Vec<tls::CertificateSummary>,
}

/// What one HTTP probe produced.
#[derive(Debug)]
pub enum ProbeOutcome {
    Response(ProbeResponse),
    /// Transport-level failure that survived the retry budget; the text
    /// becomes the report's `because` (`GET: <error>`).
    Failed(String),
}

/// Probe outcome plus the retries the fetch consumed.
#[derive(Debug)]
pub struct HttpProbe {
    pub outcome: ProbeOutcome,
    pub retries: u32,
}
