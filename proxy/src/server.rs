use crate::error::Result;
use crate::relay::TunnelRelay;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Accept loop for the tunnel endpoint. Each connection gets its own task so
/// a slow session never holds up the next accept.
pub struct ProxyServer {
    listener: TcpListener,
    relay: Arc<TunnelRelay>,
}

impl ProxyServer {
    pub async fn bind(listen_addr: &str, relay: Arc<TunnelRelay>) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` fires. Sessions already running are left to
    /// finish on their own.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Proxy server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let relay = self.relay.clone();
                            tokio::spawn(async move {
                                relay.serve(stream).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Proxy server stopped accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}
