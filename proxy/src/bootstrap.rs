use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ipmeter_common::{BandwidthLedger, normalize_ip};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
struct AllowedIpsResponse {
    success: bool,
    // The account service encodes an empty allowlist as `null`.
    #[serde(default)]
    ips: Option<Vec<String>>,
}

/// Fetches the full allowlist. Any transport failure, non-success status or
/// `success: false` payload is an error.
#[instrument(skip(timeout))]
pub async fn fetch_allowed_ips(url: &str, timeout: Duration) -> Result<Vec<String>> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ProxyError::Bootstrap(format!("invalid allowlist url {url}: {e}")))?;
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();

    let request = async {
        let response = client
            .get(uri)
            .await
            .map_err(|e| ProxyError::Bootstrap(format!("allowlist service unreachable: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Bootstrap(format!("failed to read allowlist: {e}")))?
            .to_bytes();
        Ok::<_, ProxyError>((status, body))
    };

    let (status, body) = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| {
            ProxyError::Bootstrap(format!("allowlist request timed out after {timeout:?}"))
        })??;

    if !status.is_success() {
        return Err(ProxyError::Bootstrap(format!(
            "allowlist service returned {status}"
        )));
    }

    let payload: AllowedIpsResponse = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::Bootstrap(format!("malformed allowlist payload: {e}")))?;
    if !payload.success {
        return Err(ProxyError::Bootstrap(
            "allowlist service reported failure".to_string(),
        ));
    }

    Ok(payload.ips.unwrap_or_default())
}

/// Seeds a zero entry for every IP. Returns how many entries were new.
///
/// Entries that parse as addresses are keyed the same way client peers are,
/// so `::1` and IPv4-mapped forms match the connections they describe.
/// Anything else is seeded as given.
pub fn seed_ledger(ledger: &BandwidthLedger, ips: &[String]) -> usize {
    ips.iter()
        .map(|ip| ip.trim())
        .filter(|ip| !ip.is_empty())
        .map(ledger_key)
        .filter(|ip| !ledger.ensure_entry(ip))
        .count()
}

fn ledger_key(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(addr) => normalize_ip(addr).to_string(),
        Err(_) => ip.to_string(),
    }
}

/// Loads the allowlist and seeds the ledger before the listener starts.
pub async fn run(config: &ProxyConfig, ledger: &BandwidthLedger) -> Result<usize> {
    let start = Instant::now();
    let ips = fetch_allowed_ips(&config.allowlist_url, config.bootstrap_timeout()).await?;
    debug!("Allowlist returned {} entries", ips.len());

    let seeded = seed_ledger(ledger, &ips);
    info!(
        "Loaded {} allowed IPs into memory in {:?}",
        seeded,
        start.elapsed()
    );
    Ok(seeded)
}
