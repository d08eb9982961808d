use parking_lot::RwLock;
use std::collections::HashMap;

/// Bytes per billed kilobyte. Billing uses decimal kilobytes.
pub const BYTES_PER_KB: u64 = 1000;

/// Converts a byte count to whole kilobytes, truncating the remainder.
pub fn bytes_to_kb(bytes: u64) -> u64 {
    bytes / BYTES_PER_KB
}

/// Per-IP cumulative bandwidth counter shared by every tunnel and the flusher.
///
/// Entries are created at most once per IP and never removed while the
/// process runs. Membership checks take the shared lock; inserts and
/// increments take the exclusive lock. No I/O happens under either lock.
pub struct BandwidthLedger {
    entries: RwLock<HashMap<String, u64>>,
}

impl BandwidthLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `delta_kb` to the entry for `ip`, creating it at zero first if absent.
    pub fn add(&self, ip: &str, delta_kb: u64) {
        let mut entries = self.entries.write();
        let entry = entries.entry(ip.to_string()).or_insert(0);
        *entry = entry.saturating_add(delta_kb);
    }

    /// Creates a zero entry for `ip` unless one exists.
    ///
    /// Returns `true` when the entry already existed.
    pub fn ensure_entry(&self, ip: &str) -> bool {
        if self.entries.read().contains_key(ip) {
            return true;
        }

        let mut entries = self.entries.write();
        if entries.contains_key(ip) {
            return true;
        }
        entries.insert(ip.to_string(), 0);
        false
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.entries.read().contains_key(ip)
    }

    pub fn get(&self, ip: &str) -> Option<u64> {
        self.entries.read().get(ip).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Point-in-time copy of every entry. The lock is released before returning.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.entries
            .read()
            .iter()
            .map(|(ip, kb)| (ip.clone(), *kb))
            .collect()
    }
}

impl Default for BandwidthLedger {
    fn default() -> Self {
        Self::new()
    }
}
