//! Per-connection CONNECT tunnel.
//!
//! A session walks `Accepted → IdentityResolved → Authorized →
//! TargetResolved → Connected → Relaying → Closed`. Any rejection closes the
//! client socket without writing a byte: disallowed callers must not be able
//! to tell a proxy is listening. The success line is written only after the
//! destination dial has succeeded.

use crate::access_gate::AccessGate;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, RejectReason, Result};
use ipmeter_common::{
    BandwidthLedger, bytes_to_kb, client_identity, discard_request_head, read_connect_target,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub dial_timeout: Duration,
    pub header_timeout: Duration,
    pub max_header_bytes: u64,
    pub buffer_size: usize,
}

impl RelaySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            header_timeout: config.header_timeout(),
            max_header_bytes: config.max_header_bytes,
            buffer_size: config.relay_buffer_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Success,
    Rejected(RejectReason),
    DialFailed,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    IdentityResolved,
    Authorized,
    TargetResolved,
    Connected,
    Relaying,
    Closed(CloseReason),
}

struct TunnelSession {
    state: SessionState,
    client_ip: Option<String>,
    target: Option<String>,
    bytes_up: u64,
    bytes_down: u64,
}

impl TunnelSession {
    fn new() -> Self {
        Self {
            state: SessionState::Accepted,
            client_ip: None,
            target: None,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    fn advance(&mut self, next: SessionState) {
        trace!(ip = ?self.client_ip, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Bytes moved by one copy direction and the error that ended it, if any.
#[derive(Debug)]
struct CopyOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

impl CopyOutcome {
    fn from_join_error(e: JoinError) -> Self {
        error!("Relay copy task failed: {}", e);
        Self {
            bytes: 0,
            error: Some(io::Error::other(e.to_string())),
        }
    }
}

pub struct TunnelRelay {
    ledger: Arc<BandwidthLedger>,
    gate: Arc<AccessGate>,
    settings: RelaySettings,
}

impl TunnelRelay {
    pub fn new(
        ledger: Arc<BandwidthLedger>,
        gate: Arc<AccessGate>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            ledger,
            gate,
            settings,
        }
    }

    /// Runs one client connection to completion and reports how it closed.
    pub async fn serve(&self, stream: TcpStream) -> CloseReason {
        let mut session = TunnelSession::new();
        let result = self.run(&mut session, stream).await;

        let reason = match &result {
            Ok(()) => CloseReason::Success,
            Err(ProxyError::Rejected(reject)) => CloseReason::Rejected(*reject),
            Err(ProxyError::DialFailed { .. }) => CloseReason::DialFailed,
            Err(_) => CloseReason::IoError,
        };
        session.advance(SessionState::Closed(reason));

        let ip = session.client_ip.as_deref().unwrap_or("-");
        let destination = session.target.as_deref().unwrap_or("-");
        match result {
            Ok(()) => info!(
                ip,
                destination,
                up_kb = bytes_to_kb(session.bytes_up),
                down_kb = bytes_to_kb(session.bytes_down),
                "Tunnel closed"
            ),
            Err(ProxyError::Rejected(reject)) => debug!(ip, "Connection rejected: {}", reject),
            Err(e @ ProxyError::DialFailed { .. }) => warn!(ip, "{}", e),
            Err(e) => info!(
                ip,
                destination,
                up_kb = bytes_to_kb(session.bytes_up),
                down_kb = bytes_to_kb(session.bytes_down),
                "Tunnel closed with error: {}",
                e
            ),
        }
        reason
    }

    async fn run(&self, session: &mut TunnelSession, client: TcpStream) -> Result<()> {
        let peer = client
            .peer_addr()
            .map_err(|_| ProxyError::Rejected(RejectReason::NoClientAddress))?;
        let ip = client_identity(&peer);
        session.client_ip = Some(ip.clone());
        session.advance(SessionState::IdentityResolved);

        if !self.gate.is_allowed(&ip).await {
            return Err(ProxyError::Rejected(RejectReason::UnauthorizedIp));
        }
        session.advance(SessionState::Authorized);

        let (client_read, mut client_write) = client.into_split();
        let mut client_reader = BufReader::with_capacity(self.settings.buffer_size, client_read);

        let target = self.read_target(&mut client_reader).await?;
        session.target = Some(target.clone());
        session.advance(SessionState::TargetResolved);

        let dest = self.dial(&target).await?;
        session.advance(SessionState::Connected);

        client_write.write_all(CONNECT_ESTABLISHED).await?;
        session.advance(SessionState::Relaying);
        debug!(ip = %ip, destination = %target, "Tunnel established");

        let (up, down) = self.relay(client_reader, client_write, dest).await;
        session.bytes_up = up.bytes;
        session.bytes_down = down.bytes;

        // Partial transfers are still billed.
        self.ledger.add(&ip, bytes_to_kb(up.bytes));
        self.ledger.add(&ip, bytes_to_kb(down.bytes));

        match (up.error, down.error) {
            (None, None) => Ok(()),
            (Some(e), _) => Err(ProxyError::RelayIo(format!("client to destination: {e}"))),
            (None, Some(e)) => Err(ProxyError::RelayIo(format!("destination to client: {e}"))),
        }
    }

    /// Parses the target and drains the rest of the request head within the
    /// configured time and size limits.
    async fn read_target(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<String> {
        let mut limited = reader.take(self.settings.max_header_bytes);
        let head = async {
            let target = read_connect_target(&mut limited).await?;
            discard_request_head(&mut limited).await.ok()?;
            Some(target)
        };

        match tokio::time::timeout(self.settings.header_timeout, head).await {
            Ok(Some(target)) => Ok(target),
            Ok(None) | Err(_) => Err(ProxyError::Rejected(RejectReason::NoHostHeader)),
        }
    }

    async fn dial(&self, target: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.settings.dial_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::DialFailed {
                target: target.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::DialFailed {
                target: target.to_string(),
                reason: format!("timed out after {:?}", self.settings.dial_timeout),
            }),
        }
    }

    /// Copies both directions on child tasks. The first direction to finish
    /// cancels its sibling; both are joined before returning.
    async fn relay(
        &self,
        client_reader: BufReader<OwnedReadHalf>,
        client_writer: OwnedWriteHalf,
        dest: TcpStream,
    ) -> (CopyOutcome, CopyOutcome) {
        let (dest_reader, dest_writer) = dest.into_split();
        let closed = CancellationToken::new();

        let upstream = tokio::spawn(copy_until_closed(
            client_reader,
            dest_writer,
            self.settings.buffer_size,
            closed.clone(),
        ));
        let downstream = tokio::spawn(copy_until_closed(
            dest_reader,
            client_writer,
            self.settings.buffer_size,
            closed,
        ));

        let (up, down) = tokio::join!(upstream, downstream);
        (
            up.unwrap_or_else(CopyOutcome::from_join_error),
            down.unwrap_or_else(CopyOutcome::from_join_error),
        )
    }
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    closed: CancellationToken,
) -> CopyOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _cancel_sibling = closed.clone().drop_guard();
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let error = 'copy: loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break None,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(e),
            },
        };

        // Counted per write: a chunk cut short by cancellation still counts
        // what reached the peer.
        let mut offset = 0;
        while offset < n {
            let written = tokio::select! {
                _ = closed.cancelled() => break 'copy None,
                written = writer.write(&buf[offset..n]) => written,
            };
            match written {
                Ok(0) => break 'copy Some(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    offset += written;
                    bytes += written as u64;
                }
                Err(e) => break 'copy Some(e),
            }
        }
    };

    let _ = writer.shutdown().await;
    CopyOutcome { bytes, error }
}
