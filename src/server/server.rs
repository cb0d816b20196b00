// Server instance: TLS and WebSocket listeners feeding the session loop

use crate::crypto::KeyHash;
use crate::server::config::ServerConfig;
use crate::server::session::{run_session, ServerCtx};
use crate::server::store::QueueStore;
use crate::server::subscription::SubscriptionManager;
use crate::transport::tls::TlsIdentity;
use crate::transport::ws;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// A running SMP server.
pub struct ServerInstance {
    ctx: Arc<ServerCtx>,
    key_hash: KeyHash,
    tcp_addr: SocketAddr,
    ws_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerInstance {
    /// Starts the server from config, loading the TLS identity from the
    /// configured certificate and key files.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let identity = TlsIdentity::from_files(
            &config.tls_certificate_file,
            &config.tls_private_key_file,
        )?;
        Self::start_with_identity(config, identity).await
    }

    /// Starts the server with an already-built TLS identity (tests hand in
    /// a generated certificate).
    pub async fn start_with_identity(
        config: ServerConfig,
        identity: TlsIdentity,
    ) -> Result<Self> {
        let store = QueueStore::new(
            &config.sqlite_database,
            config.message_quota_per_queue,
            config.max_active_queues,
        )
        .context("opening queue store")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ServerCtx {
            store,
            subs: SubscriptionManager::new(),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            shutdown: shutdown_rx.clone(),
        });

        let key_hash = identity.key_hash;

        let tcp_listener = TcpListener::bind((config.bind_host.as_str(), config.tcp_port))
            .await
            .with_context(|| format!("binding {}:{}", config.bind_host, config.tcp_port))?;
        let tcp_addr = tcp_listener.local_addr()?;
        tracing::info!(addr = %tcp_addr, key_hash = %key_hash, "TLS listener started");

        let ws_addr = match config.ws_port {
            Some(port) => {
                let listener = TcpListener::bind((config.bind_host.as_str(), port))
                    .await
                    .with_context(|| format!("binding ws {}:{}", config.bind_host, port))?;
                let addr = listener.local_addr()?;
                tracing::info!(addr = %addr, "WebSocket listener started");
                let ctx = ctx.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            result = listener.accept() => match result {
                                Ok((stream, peer)) => {
                                    let ctx = ctx.clone();
                                    tokio::spawn(async move {
                                        match ws::accept(stream).await {
                                            Ok(transport) => run_session(transport, ctx).await,
                                            Err(e) => {
                                                tracing::debug!(peer = %peer, error = %e, "ws handshake failed")
                                            }
                                        }
                                    });
                                }
                                Err(e) => tracing::warn!(error = %e, "ws accept error"),
                            },
                            _ = shutdown.changed() => {
                                tracing::info!("ws listener shutting down");
                                break;
                            }
                        }
                    }
                });
                Some(addr)
            }
            None => None,
        };

        let accept_ctx = ctx.clone();
        let accept_identity = identity.clone();
        let mut accept_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = tcp_listener.accept() => match result {
                        Ok((stream, peer)) => {
                            let ctx = accept_ctx.clone();
                            let identity = accept_identity.clone();
                            tokio::spawn(async move {
                                match identity.accept(stream).await {
                                    Ok(transport) => run_session(transport, ctx).await,
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "tls handshake failed")
                                    }
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept error"),
                    },
                    _ = accept_shutdown.changed() => {
                        tracing::info!("listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            ctx,
            key_hash,
            tcp_addr,
            ws_addr,
            shutdown_tx,
        })
    }

    pub fn key_hash(&self) -> KeyHash {
        self.key_hash
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    pub fn ctx(&self) -> &Arc<ServerCtx> {
        &self.ctx
    }

    /// Stops the listeners and closes every live session's transport.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
