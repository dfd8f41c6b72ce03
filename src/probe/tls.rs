//! TLS peer-chain inspection for certificate-expiry checks.
//!
//! reqwest does not expose peer certificates, so a dedicated handshake
//! captures the chain after a successful https fetch.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;
use x509_parser::prelude::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// The fields the expiry predicate needs from one peer certificate.
#[derive(Debug, Clone)]
pub struct CertificateSummary {
    pub common_name: String,
    pub not_after: DateTime<Utc>,
}

impl CertificateSummary {
    /// Seconds until `not_after`; negative once expired.
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds()
    }

    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_in(now) <= ChronoDuration::from_std(window).map_or(i64::MAX, |w| w.num_seconds())
    }
}

fn host_port(url: &str) -> Result<(String, u16)> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| crate::err!("no host in URL `{url}`"))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| crate::err!("unable to determine port for `{url}`"))?;
    Ok((host, port))
}

/// Handshake with the service endpoint and summarize its peer chain.
pub async fn peer_certificates(url: &str) -> Result<Vec<CertificateSummary>> {
    let (host, port) = host_port(url)?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // Unusable platform certificates are skipped, not fatal.
        let _ = roots.add(cert);
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| crate::err!("connect to {host}:{port} timed out"))??;

    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| crate::err!("invalid server name `{host}`"))?;

    let tls_stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| crate::err!("TLS handshake with {host}:{port} timed out"))??;

    let (_, session) = tls_stream.get_ref();
    let mut summaries = Vec::new();
    for der in session.peer_certificates().unwrap_or_default() {
        let Ok((_, certificate)) = parse_x509_certificate(der.as_ref()) else {
            continue;
        };
        let common_name = certificate
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let Some(not_after) =
            DateTime::<Utc>::from_timestamp(certificate.validity().not_after.timestamp(), 0)
        else {
            continue;
        };
        summaries.push(CertificateSummary {
            common_name,
            not_after,
        });
    }

    Ok(summaries)
}
