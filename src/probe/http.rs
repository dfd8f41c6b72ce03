//! HTTP probe: a GET against the service URL through its prebuilt client,
//! wrapped in the bounded retry helper.

use crate::error::Result;
use crate::probe::{tls, HttpProbe, ProbeOutcome, ProbeResponse, USER_AGENT};
use crate::retry::RetryPolicy;
use crate::service::Service;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Build the per-service client: redirect policy from `follow`, TLS
/// verification from `insecure`, the service header map on every request,
/// and the service timeout as the response read timeout.
pub fn build_service_client(service: &Service) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    for (name, value) in &service.header {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| crate::err!("invalid header name `{name}`: {err}"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|err| crate::err!("invalid header value for `{name}`: {err}"))?;
        headers.insert(header_name, header_value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(service.timeout)
        .tcp_keepalive(TCP_KEEPALIVE);

    if !service.follow {
        builder = builder.redirect(Policy::none());
    }
    if service.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder.build()?)
}

/// Fetch the service URL. Transport failures become
/// `ProbeOutcome::Failed`; an error reading an already-open body aborts
/// the tick and is surfaced to the caller.
pub async fn fetch(service: &Service) -> Result<HttpProbe> {
    let url = service
        .url
        .as_deref()
        .ok_or_else(|| crate::err!("service `{}` has no URL to probe", service.name))?;
    let client = service
        .client
        .as_ref()
        .ok_or_else(|| crate::err!("service `{}` has no HTTP client", service.name))?;

    let policy = RetryPolicy::new(service.retry_limit, service.retry_interval);
    let retried = policy.run(|| client.get(url).send()).await;

    let response = match retried.outcome {
        Ok(response) => response,
        Err(err) => {
            return Ok(HttpProbe {
                outcome: ProbeOutcome::Failed(format!("GET: {err}")),
                retries: retried.retries,
            })
        }
    };

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = read_body(response, service).await?;

    // The body predicate short-circuits every later check, so the extra
    // TLS handshake is only worth it when certificates can matter.
    let certificates = if url.starts_with("https://") && service.expect.body.is_none() {
        match tls::peer_certificates(url).await {
            Ok(certificates) => certificates,
            Err(err) => {
                debug!(service = %service.name, error = %err, "TLS chain inspection failed");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    Ok(HttpProbe {
        outcome: ProbeOutcome::Response(ProbeResponse {
            status,
            headers,
            body,
            certificates,
        }),
        retries: retried.retries,
    })
}

/// Read the response body when a body predicate or a read limit asks for
/// it; otherwise drop the response so the connection closes.
async fn read_body(mut response: reqwest::Response, service: &Service) -> Result<Option<Vec<u8>>> {
    if service.expect.body.is_none() && service.read_limit == 0 {
        return Ok(None);
    }

    let limit = if service.read_limit > 0 {
        service.read_limit
    } else {
        u64::MAX
    };

    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let remaining = limit - body.len() as u64;
        if chunk.len() as u64 >= remaining {
            body.extend_from_slice(&chunk[..remaining as usize]);
            break;
        }
        body.extend_from_slice(&chunk);
    }

    if service.expect.body.is_none() {
        debug!(
            service = %service.name,
            read_limit = service.read_limit,
            bytes = body.len(),
            "read limited body"
        );
    }

    Ok(Some(body))
}
