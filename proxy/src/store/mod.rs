//! Persisted IP and user bandwidth records.
//!
//! The proxy only ever needs three operations from the store: an existence
//! check used by the access gate, and the two absolute writes used by the
//! flusher. Everything else about users (login, CRUD) belongs to the
//! external account service.

#[cfg(test)]
pub mod memory;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait BandwidthStore: Send + Sync {
    /// Number of IP records matching `ip`; non-zero means allowlisted.
    async fn count_matching_ip(&self, ip: &str) -> Result<u64>;

    /// Sets the IP record's bandwidth to `kilobytes`, inserting the record if absent.
    async fn upsert_ip_bandwidth(&self, ip: &str, kilobytes: u64) -> Result<()>;

    /// Sets bandwidth to `kilobytes` on every user whose IP set contains `ip`.
    /// Returns the number of user records updated.
    async fn set_bandwidth_for_users_with_ip(&self, ip: &str, kilobytes: u64) -> Result<u64>;
}
