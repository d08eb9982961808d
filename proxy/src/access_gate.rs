use crate::error::ProxyError;
use crate::store::BandwidthStore;
use ipmeter_common::BandwidthLedger;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Allowlist check backed by the ledger as a write-through cache.
///
/// An IP present in the ledger is allowed without touching the store.
/// On a miss the store is queried; a match seeds a zero ledger entry and is
/// cached for the rest of the process lifetime. Denials are never cached, so
/// an IP added to the allowlist later is picked up on its next connection.
/// There is no runtime revocation.
pub struct AccessGate {
    ledger: Arc<BandwidthLedger>,
    store: Arc<dyn BandwidthStore>,
    lookup_timeout: Duration,
}

impl AccessGate {
    pub fn new(
        ledger: Arc<BandwidthLedger>,
        store: Arc<dyn BandwidthStore>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            lookup_timeout,
        }
    }

    pub async fn is_allowed(&self, ip: &str) -> bool {
        if self.ledger.contains(ip) {
            return true;
        }

        let lookup = tokio::time::timeout(self.lookup_timeout, self.store.count_matching_ip(ip));
        let count = match lookup.await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(ip, "Allowlist lookup failed, denying: {}", e);
                return false;
            }
            Err(_) => {
                let e = ProxyError::Persistence(format!(
                    "lookup timed out after {:?}",
                    self.lookup_timeout
                ));
                warn!(ip, "Allowlist lookup failed, denying: {}", e);
                return false;
            }
        };

        if count == 0 {
            debug!(ip, "IP not in allowlist");
            return false;
        }

        if !self.ledger.ensure_entry(ip) {
            info!(ip, "IP admitted from store");
        }
        true
    }
}
