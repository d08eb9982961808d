use super::BandwidthStore;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory store with failure injection for gate and flusher tests.
#[derive(Default)]
pub struct MemoryStore {
    ips: Mutex<HashMap<String, u64>>,
    users: Mutex<HashMap<String, (HashSet<String>, u64)>>,
    failing_ips: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
    lookups: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with_ips(ips: &[&str]) -> Self {
        let store = Self::default();
        for ip in ips {
            store.ips.lock().insert(ip.to_string(), 0);
        }
        store
    }

    pub fn add_ip(&self, ip: &str) {
        self.ips.lock().insert(ip.to_string(), 0);
    }

    pub fn add_user(&self, email: &str, ips: &[&str]) {
        let ips = ips.iter().map(|ip| ip.to_string()).collect();
        self.users.lock().insert(email.to_string(), (ips, 0));
    }

    pub fn fail_ip(&self, ip: &str) {
        self.failing_ips.lock().insert(ip.to_string());
    }

    pub fn fail_everything(&self) {
        *self.fail_all.lock() = true;
    }

    pub fn ip_bandwidth(&self, ip: &str) -> Option<u64> {
        self.ips.lock().get(ip).copied()
    }

    pub fn user_bandwidth(&self, email: &str) -> Option<u64> {
        self.users.lock().get(email).map(|(_, kb)| *kb)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, ip: &str) -> Result<()> {
        if *self.fail_all.lock() || self.failing_ips.lock().contains(ip) {
            return Err(ProxyError::Persistence(format!("store unavailable for {ip}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BandwidthStore for MemoryStore {
    async fn count_matching_ip(&self, ip: &str) -> Result<u64> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check(ip)?;
        Ok(u64::from(self.ips.lock().contains_key(ip)))
    }

    async fn upsert_ip_bandwidth(&self, ip: &str, kilobytes: u64) -> Result<()> {
        self.check(ip)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.ips.lock().insert(ip.to_string(), kilobytes);
        Ok(())
    }

    async fn set_bandwidth_for_users_with_ip(&self, ip: &str, kilobytes: u64) -> Result<u64> {
        self.check(ip)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut updated = 0;
        for (ips, bandwidth) in self.users.lock().values_mut() {
            if ips.contains(ip) {
                *bandwidth = kilobytes;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
