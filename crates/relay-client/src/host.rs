//! Host URL handling and the liveness probe.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::errors::ClientError;

/// Reduce a user-entered host to `scheme://host[:port]`.
///
/// Only `http` and `https` are accepted.
pub fn normalize_host_url(raw: &str) -> Result<String, ClientError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidUrl("empty".into()));
    }
    let parsed = Url::parse(trimmed).map_err(|e| ClientError::InvalidUrl(format!("{trimmed}: {e}")))?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ClientError::InvalidUrl(trimmed.to_string()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::InvalidUrl(trimmed.to_string()))?;
    Ok(match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Auth,
    Unreachable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency_ms: u64,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }
}

/// `GET {url}/health`. 2xx is healthy, 401/403 means the server is up but
/// wants credentials, everything else counts as unreachable.
pub async fn probe_health(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<ProbeResult, ClientError> {
    let base = normalize_host_url(url)?;
    let health = format!("{base}/health");
    let started = Instant::now();

    let status = match client.get(&health).timeout(timeout).send().await {
        Ok(resp) => {
            let code = resp.status();
            if code.is_success() {
                ProbeStatus::Ok
            } else if code.as_u16() == 401 || code.as_u16() == 403 {
                ProbeStatus::Auth
            } else {
                ProbeStatus::Unreachable
            }
        }
        Err(e) => {
            debug!(url = %health, error = %e, "health probe failed");
            ProbeStatus::Unreachable
        }
    };
    Ok(ProbeResult {
        status,
        latency_ms: started.elapsed().as_millis() as u64,
    })
}
