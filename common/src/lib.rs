pub mod bandwidth;
pub mod connect;
pub mod identity;

pub use bandwidth::{BYTES_PER_KB, BandwidthLedger, bytes_to_kb};
pub use connect::{discard_request_head, read_connect_target};
pub use identity::{client_identity, normalize_ip};
