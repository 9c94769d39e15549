// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log server: serves the local log to remote readers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  accept   ┌────────────────────┐
//! │ accept task  │──────────▶│ handler task (1/N) │── ProtocolServer ──▶ LogStore
//! │  (listener)  │           └────────────────────┘
//! │              │◀── retired ids (SegQueue) ── handler exit
//! └──────────────┘
//! ```
//!
//! Handlers register in a `DashMap` and push their id onto a lock-free
//! queue when they finish; the accept task reaps them from there instead of
//! scanning all handlers.
//!
//! # Shutdown
//!
//! `stop()` flips the shutdown watch. The accept task exits and drops the
//! listener; every handler drops its socket. Handlers still running after
//! `stop_timeout` are logged and aborted.

use crate::config::LogServerConfig;
use crate::error::{ReplicationError, Result};
use crate::log_store::LogStore;
use crate::metrics;
use crate::protocol::{build_validator, BoxedStream, FramedConnection, ProtocolServer, ServerSettings};
use crate::tls;
use crate::uri::LogUri;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

/// Interval at which the accept task reaps finished handlers when idle.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of a connected client.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub id: u64,
    pub peer: SocketAddr,
    /// Set once the handshake completes.
    pub client_source_id: Option<String>,
    pub connected_for: Duration,
}

struct HandlerEntry {
    peer: SocketAddr,
    client_source_id: Arc<OnceLock<String>>,
    started_at: Instant,
    handle: JoinHandle<()>,
}

/// Live handlers plus the queue of finished ones.
#[derive(Default)]
struct HandlerRegistry {
    handlers: DashMap<u64, HandlerEntry>,
    retired: SegQueue<u64>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Remove every handler that reported completion.
    fn reap(&self) -> usize {
        let mut reaped = 0;
        while let Some(id) = self.retired.pop() {
            if self.handlers.remove(&id).is_some() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            metrics::set_active_handlers(self.handlers.len());
        }
        reaped
    }
}

/// TCP (optionally TLS) server running one protocol handler per client.
pub struct LogServer {
    config: LogServerConfig,
    uri: LogUri,
    log: Arc<dyn LogStore>,
    settings: ServerSettings,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl LogServer {
    /// Resolve the listen URI and prepare TLS material. Does not bind.
    pub fn new(config: LogServerConfig, log: Arc<dyn LogStore>) -> Result<Self> {
        let uri = LogUri::parse(&config.listen_uri)?;

        let acceptor = if uri.use_tls {
            let tls_config = config.tls.as_ref().ok_or_else(|| {
                ReplicationError::Config(format!(
                    "{} requires server tls cert_path and key_path",
                    config.listen_uri
                ))
            })?;
            Some(tls::acceptor(tls_config)?)
        } else {
            None
        };

        let settings = ServerSettings {
            source_id: config.source_id.clone(),
            role: config.role.clone(),
            version: config.version.clone(),
            buffer_size: config.buffer_size.max(1),
            validator: build_validator(config.validator),
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            uri,
            log,
            settings,
            acceptor,
            registry: Arc::new(HandlerRegistry::default()),
            shutdown_tx,
            accept_handle: None,
            local_addr: None,
        })
    }

    /// Use an already-built TLS acceptor (e.g. from in-memory PEM).
    pub fn with_tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Bind and start accepting clients. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.accept_handle.is_some() {
            return Err(ReplicationError::InvalidState {
                expected: "stopped".to_string(),
                actual: "running".to_string(),
            });
        }
        if self.uri.use_tls && self.acceptor.is_none() {
            return Err(ReplicationError::Config(format!(
                "{} requires a TLS acceptor",
                self.uri
            )));
        }

        let listener = TcpListener::bind(self.uri.socket_addr())
            .await
            .map_err(|e| ReplicationError::io("bind", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ReplicationError::io("local_addr", e))?;

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let accept = AcceptLoop {
            listener,
            log: Arc::clone(&self.log),
            settings: self.settings.clone(),
            acceptor: self.acceptor.clone(),
            registry: Arc::clone(&self.registry),
            shutdown_rx,
        };
        self.accept_handle = Some(tokio::spawn(accept.run()));
        self.local_addr = Some(local_addr);

        info!(
            uri = %self.uri,
            local_addr = %local_addr,
            tls = self.uri.use_tls,
            source_id = %self.settings.source_id,
            "Log server started"
        );
        Ok(local_addr)
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// URI clients should connect to (with the actual bound port).
    pub fn connect_uri(&self) -> Option<String> {
        self.local_addr.map(|addr| {
            let scheme = if self.uri.use_tls { "secure" } else { "plain" };
            format!("{}://{}", scheme, addr)
        })
    }

    pub fn is_running(&self) -> bool {
        self.accept_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Number of live client handlers.
    pub fn client_count(&self) -> usize {
        self.registry.reap();
        self.registry.handlers.len()
    }

    /// Snapshot of live client handlers.
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.registry.reap();
        let mut infos: Vec<HandlerInfo> = self
            .registry
            .handlers
            .iter()
            .map(|entry| HandlerInfo {
                id: *entry.key(),
                peer: entry.peer,
                client_source_id: entry.client_source_id.get().cloned(),
                connected_for: entry.started_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Stop accepting, disconnect every client and wait for handlers.
    ///
    /// Handlers still running after `stop_timeout` are logged and aborted.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(accept_handle) = self.accept_handle.take() else {
            return Ok(());
        };

        info!(uri = %self.uri, "Stopping log server");
        self.shutdown_tx.send_replace(true);

        if let Err(e) = accept_handle.await {
            if e.is_panic() {
                error!(error = %e, "Accept task panicked");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout_duration();
        let ids: Vec<u64> = self.registry.handlers.iter().map(|e| *e.key()).collect();
        let entries: Vec<(u64, HandlerEntry)> = ids
            .into_iter()
            .filter_map(|id| self.registry.handlers.remove(&id))
            .collect();

        let finished = join_all(entries.into_iter().map(|(id, mut entry)| async move {
            if tokio::time::timeout_at(deadline, &mut entry.handle).await.is_ok() {
                return true;
            }
            warn!(
                handler = id,
                peer = %entry.peer,
                client = ?entry.client_source_id.get(),
                "Handler did not stop in time; aborting"
            );
            metrics::record_handler_abandoned();
            entry.handle.abort();
            false
        }))
        .await;
        let abandoned = finished.iter().filter(|done| !**done).count();
        while self.registry.retired.pop().is_some() {}
        metrics::set_active_handlers(0);

        if abandoned > 0 {
            warn!(abandoned, "Log server stopped with unfinished handlers");
        } else {
            info!("Log server stopped");
        }
        self.local_addr = None;
        Ok(())
    }
}

impl Drop for LogServer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

struct AcceptLoop {
    listener: TcpListener,
    log: Arc<dyn LogStore>,
    settings: ServerSettings,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<HandlerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut reap_timer = tokio::time::interval(REAP_INTERVAL);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            metrics::record_server_connection(true);
                            self.spawn_handler(stream, peer);
                        }
                        Err(e) => {
                            metrics::record_server_connection(false);
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                    self.registry.reap();
                }
                _ = reap_timer.tick() => {
                    let reaped = self.registry.reap();
                    if reaped > 0 {
                        debug!(reaped, "Reaped finished handlers");
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Accept loop stopping");
                        break;
                    }
                }
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let client_source_id = Arc::new(OnceLock::new());

        let handler = Handler {
            id,
            peer,
            stream,
            log: Arc::clone(&self.log),
            settings: self.settings.clone(),
            acceptor: self.acceptor.clone(),
            client_source_id: Arc::clone(&client_source_id),
            registry: Arc::clone(&self.registry),
            shutdown_rx: self.shutdown_rx.clone(),
        };
        let handle = tokio::spawn(handler.run());

        // Inserted before the next reap, so a fast-finishing handler is
        // always found when its id is popped.
        self.registry.handlers.insert(
            id,
            HandlerEntry {
                peer,
                client_source_id,
                started_at: Instant::now(),
                handle,
            },
        );
        metrics::set_active_handlers(self.registry.handlers.len());
        debug!(handler = id, peer = %peer, "Client connected");
    }
}

struct Handler {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    log: Arc<dyn LogStore>,
    settings: ServerSettings,
    acceptor: Option<TlsAcceptor>,
    client_source_id: Arc<OnceLock<String>>,
    registry: Arc<HandlerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Handler {
    async fn run(self) {
        let span = tracing::info_span!("log_server_handler", handler = self.id, peer = %self.peer);
        let id = self.id;
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown_rx.clone();

        async move {
            let result = tokio::select! {
                result = self.serve() => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    debug!("Handler interrupted by shutdown");
                    Ok(())
                }
            };

            match result {
                Ok(()) => debug!("Handler finished"),
                Err(e) if e.is_retryable() => debug!(error = %e, "Client disconnected"),
                Err(e) if e.is_protocol_fault() => info!(error = %e, "Client session ended"),
                Err(e) => {
                    metrics::record_error("log_server", "handler");
                    warn!(error = %e, "Handler failed");
                }
            }
            registry.retired.push(id);
        }
        .instrument(span)
        .await
    }

    async fn serve(self) -> Result<()> {
        let _ = self.stream.set_nodelay(true);
        let stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(self.stream)
                    .await
                    .map_err(|e| ReplicationError::io("tls_accept", e))?,
            ),
            None => Box::new(self.stream),
        };

        let conn = FramedConnection::new(stream, self.peer.to_string());
        let mut server = ProtocolServer::new(conn, self.log, self.settings);
        let response = server.handshake().await?;
        let _ = self.client_source_id.set(response.source_id);
        server.serve().await
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
