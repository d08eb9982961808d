use crate::error::Result;
use crate::store::BandwidthStore;
use ipmeter_common::BandwidthLedger;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub ips_flushed: usize,
    pub users_updated: u64,
    pub failures: usize,
}

/// Persists ledger totals to the store on a fixed schedule.
///
/// Every write is an absolute overwrite of a value that only grows in the
/// ledger, so repeating a cycle without new traffic changes nothing.
pub struct Flusher {
    ledger: Arc<BandwidthLedger>,
    store: Arc<dyn BandwidthStore>,
    interval: Duration,
}

impl Flusher {
    pub fn new(
        ledger: Arc<BandwidthLedger>,
        store: Arc<dyn BandwidthStore>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            interval,
        }
    }

    /// One flush cycle. A failing IP is logged and skipped.
    pub async fn flush_once(&self) -> FlushReport {
        let snapshot = self.ledger.snapshot();
        let mut report = FlushReport::default();

        for (ip, kilobytes) in snapshot {
            match self.persist(&ip, kilobytes).await {
                Ok(users) => {
                    report.ips_flushed += 1;
                    report.users_updated += users;
                }
                Err(e) => {
                    warn!(ip = %ip, kilobytes, "Failed to flush bandwidth: {}", e);
                    report.failures += 1;
                }
            }
        }

        info!(
            ips = report.ips_flushed,
            users = report.users_updated,
            failures = report.failures,
            "Bandwidth flush complete"
        );
        report
    }

    async fn persist(&self, ip: &str, kilobytes: u64) -> Result<u64> {
        self.store.upsert_ip_bandwidth(ip, kilobytes).await?;
        self.store.set_bandwidth_for_users_with_ip(ip, kilobytes).await
    }

    /// Flushes immediately, then every interval. On shutdown a last cycle
    /// runs so traffic since the previous tick is not lost.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Running final bandwidth flush");
                    self.flush_once().await;
                    break;
                }
            }
        }
    }
}
