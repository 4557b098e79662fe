//! Server side: storage engine, subscription fan-out, stream sessions.

pub mod content;
pub mod session;
pub mod storage;
pub mod subscriptions;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::meta::MetadataStore;
pub use session::SessionConfig;
use storage::StorageEngine;
use subscriptions::SubscriptionRegistry;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    pub session: SessionConfig,
    /// How often the stale-lock sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:50051".to_string(),
            storage_root: PathBuf::from("server_storage"),
            session: SessionConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// The listening server: accept loop plus the stale-lock sweeper.
pub struct SyncServer {
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: ServerConfig,
}

impl SyncServer {
    pub async fn bind(config: ServerConfig, meta: Arc<dyn MetadataStore>) -> Result<Self> {
        let storage = Arc::new(
            StorageEngine::new(config.storage_root.clone(), meta)
                .context("failed to initialize storage engine")?,
        );
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;

        info!(addr = %listener.local_addr()?, root = %config.storage_root.display(), "server listening");

        Ok(Self {
            listener,
            storage,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn storage(&self) -> Arc<StorageEngine> {
        self.storage.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let sweeper_storage = self.storage.clone();
        let write_timeout = self.config.session.write_timeout;
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweeper_storage.check_stale_locks(write_timeout);
            }
        });

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "accepted connection");
                    tokio::spawn(session::run_session(
                        self.storage.clone(),
                        self.subscriptions.clone(),
                        self.config.session.clone(),
                        stream,
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }
}
