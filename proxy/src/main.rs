mod access_gate;
mod api;
mod bootstrap;
mod config;
mod entity;
mod error;
mod flusher;
mod relay;
mod server;
mod store;
mod telemetry;

use access_gate::AccessGate;
use anyhow::{Context, Result};
use api::ApiServer;
use clap::Parser;
use config::ProxyConfig;
use flusher::Flusher;
use ipmeter_common::BandwidthLedger;
use relay::{RelaySettings, TunnelRelay};
use server::ProxyServer;
use std::sync::Arc;
use store::{BandwidthStore, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "ipmeter-proxy")]
#[command(about = "IP-allowlisted CONNECT proxy with per-IP bandwidth metering", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "proxy.toml")]
    config: String,

    /// Tunnel listen address
    #[arg(long, env = "IPMETER_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Admin API listen address
    #[arg(long, env = "IPMETER_API_ADDR")]
    api_addr: Option<String>,

    /// Allowlist service endpoint
    #[arg(long, env = "IPMETER_ALLOWLIST_URL")]
    allowlist_url: Option<String>,

    /// SQLite database path
    #[arg(long, env = "IPMETER_DATABASE_PATH")]
    database_path: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "IPMETER_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, cfg: &mut ProxyConfig) {
        if let Some(listen_addr) = self.listen_addr {
            cfg.listen_addr = listen_addr;
        }
        if let Some(api_addr) = self.api_addr {
            cfg.api_addr = Some(api_addr);
        }
        if let Some(allowlist_url) = self.allowlist_url {
            cfg.allowlist_url = allowlist_url;
        }
        if let Some(database_path) = self.database_path {
            cfg.database_path = database_path;
        }
        if let Some(log_level) = self.log_level {
            cfg.log_level = log_level;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone();
    let mut cfg = ProxyConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    args.apply(&mut cfg);

    let _log_guard = telemetry::init_tracing(
        cfg.log_dir.as_deref(),
        &cfg.log_file,
        &cfg.log_level,
        cfg.console_port,
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = cfg.runtime_threads {
        builder.worker_threads(threads);
    }
    let runtime = builder
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: ProxyConfig) -> Result<()> {
    info!("Starting ipmeter proxy");
    info!("Listen address: {}", cfg.listen_addr);
    info!("Allowlist service: {}", cfg.allowlist_url);
    info!("Database: {}", cfg.database_path);
    match cfg.runtime_threads {
        Some(threads) => info!("Runtime threads: {}", threads),
        None => info!("Runtime threads: default (CPU cores)"),
    }

    let store: Arc<dyn BandwidthStore> = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .await
            .context("Failed to open bandwidth store")?,
    );
    let ledger = Arc::new(BandwidthLedger::new());

    if let Err(e) = bootstrap::run(&cfg, &ledger).await {
        error!("Bootstrap failed, refusing to serve traffic: {}", e);
        return Err(e).context("Failed to load the allowlist");
    }

    let shutdown = CancellationToken::new();

    let flusher = Arc::new(Flusher::new(
        ledger.clone(),
        store.clone(),
        cfg.flush_interval(),
    ));
    let flusher_handle = {
        let flusher = flusher.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { flusher.run(shutdown).await })
    };

    let api_handle = cfg.api_addr.clone().map(|api_addr| {
        let api_server = ApiServer::new(api_addr, ledger.clone(), flusher.clone());
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = api_server.run(shutdown).await {
                error!("API server error: {}", e);
            }
        })
    });

    let gate = Arc::new(AccessGate::new(
        ledger.clone(),
        store,
        cfg.lookup_timeout(),
    ));
    let relay = Arc::new(TunnelRelay::new(
        ledger,
        gate,
        RelaySettings::from_config(&cfg),
    ));
    let server = ProxyServer::bind(&cfg.listen_addr, relay)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    shutdown.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        });
    }

    info!("Proxy started successfully");
    let served = server.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = flusher_handle.await {
        error!("Flusher task failed: {}", e);
    }
    if let Some(api_handle) = api_handle {
        let _ = api_handle.await;
    }

    info!("Shutting down proxy");
    served.context("Proxy server stopped with error")
}
