// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote log client: pulls a server's log into this node.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──extract()──▶ Connecting ──handshake OK──▶ Connected
//!      ▲                          ▲  │                         │
//!      │ protocol fault           │  └── retry (fixed delay) ──┘ I/O failure
//!      └──────────────────────────┴──────── Reconnecting ◀─────┘
//!
//! any state ──shutdown()──▶ ShuttingDown (terminal)
//! ```
//!
//! # Guarantees
//!
//! - Events are returned in log order. Fragments re-sent after a reconnect
//!   are skipped, so a transaction is never delivered twice.
//! - I/O failures are retried forever; only shutdown stops the loop.
//! - Protocol faults (NOK, error frames, out-of-sequence data) close the
//!   connection and are returned to the caller; the last position is kept.
//! - Blocked connects and reads are interrupted by shutdown. The socket is
//!   owned by the session and dropped exactly once.

use crate::config::RemoteClientConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{ControlKind, ControlMarker, Header, ReplicatedEvent};
use crate::metrics;
use crate::protocol::{
    BoxedStream, Capabilities, FramedConnection, HandshakeResponse, ProtocolClient, SeqnoRange,
};
use crate::resilience::{ConnectStats, RetryConfig};
use crate::tls;
use crate::uri::{ConnectionUriRotator, LogUri};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace, warn};

/// Remote client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Connecting => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Reconnecting => "Reconnecting",
            ClientState::ShuttingDown => "ShuttingDown",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clonable handle that asks a client to stop from another task.
#[derive(Clone)]
pub struct ClientShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl ClientShutdown {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sent to the owner whenever a read fails and the client reconnects.
#[derive(Debug, Clone)]
pub struct OutOfSequenceNotice {
    pub uri: String,
    /// Last seqno received before the failure.
    pub last_seqno: Option<u64>,
    pub reason: String,
}

struct Session {
    proto: ProtocolClient,
    uri: LogUri,
    server: Capabilities,
    range: SeqnoRange,
    /// Seqno expected first when the client has no position yet.
    expected_first: Option<u64>,
    /// Events received in the current window; `None` when a request is due.
    window: Option<u32>,
}

/// Client side of log distribution with failover and reconnect.
pub struct RemoteLogClient {
    config: RemoteClientConfig,
    rotator: ConnectionUriRotator,
    retry: RetryConfig,
    connector: Option<TlsConnector>,
    session: Option<Session>,
    /// Last event accepted from the server.
    last_received: Option<Header>,
    /// Last event returned by `extract`.
    last_delivered: Option<Header>,
    /// Epoch advertised when no event has been seen.
    seed_epoch: u64,
    resume_event_id: Option<String>,
    pending: VecDeque<ReplicatedEvent>,
    stats: ConnectStats,
    state_tx: watch::Sender<ClientState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    notice_tx: mpsc::UnboundedSender<OutOfSequenceNotice>,
    notice_rx: Option<mpsc::UnboundedReceiver<OutOfSequenceNotice>>,
}

impl RemoteLogClient {
    pub fn new(config: RemoteClientConfig) -> Result<Self> {
        let rotator = ConnectionUriRotator::from_strs(&config.uris)?;

        let needs_tls = rotator.uris().iter().any(|u| u.use_tls);
        let connector = match (&config.tls, needs_tls) {
            (Some(tls_config), _) => Some(tls::connector(tls_config)?),
            (None, true) => {
                return Err(ReplicationError::Config(
                    "secure:// URIs require client tls ca_path".to_string(),
                ))
            }
            (None, false) => None,
        };

        let retry = RetryConfig::from_client_config(&config);
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            rotator,
            retry,
            connector,
            session: None,
            last_received: None,
            last_delivered: None,
            seed_epoch: 0,
            resume_event_id: None,
            pending: VecDeque::new(),
            stats: ConnectStats::default(),
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            notice_tx,
            notice_rx: Some(notice_rx),
        })
    }

    /// Use an already-built TLS connector (e.g. from in-memory PEM).
    pub fn with_tls_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Seed the restart point, typically from the last event in the local log.
    pub fn set_last_position(&mut self, header: Header) {
        self.seed_epoch = header.epoch_number;
        self.last_received = Some(header.clone());
        self.last_delivered = Some(header);
    }

    /// Seed the epoch advertised when no position is known.
    pub fn set_last_epoch(&mut self, epoch: u64) {
        self.seed_epoch = epoch;
    }

    /// Resume from an opaque source position on the next connection.
    pub fn resume_from(&mut self, event_id: impl Into<String>) {
        self.resume_event_id = Some(event_id.into());
    }

    /// Last event returned by `extract`.
    pub fn last_position(&self) -> Option<&Header> {
        self.last_delivered.as_ref()
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub fn shutdown_handle(&self) -> ClientShutdown {
        ClientShutdown {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Receiver for reconnect notifications. Can be taken once.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<OutOfSequenceNotice>> {
        self.notice_rx.take()
    }

    pub fn connect_stats(&self) -> ConnectStats {
        self.stats
    }

    /// Capabilities of the server currently connected to.
    pub fn connected_server(&self) -> Option<&Capabilities> {
        self.session.as_ref().map(|s| &s.server)
    }

    /// URI currently connected to.
    pub fn connected_uri(&self) -> Option<&LogUri> {
        self.session.as_ref().map(|s| &s.uri)
    }

    /// Seqno range advertised by the current server at handshake.
    pub fn server_range(&self) -> Option<SeqnoRange> {
        self.session.as_ref().map(|s| s.range)
    }

    fn set_state(&self, state: ClientState) {
        if *self.state_tx.borrow() == ClientState::ShuttingDown {
            return;
        }
        self.state_tx.send_replace(state);
        metrics::set_client_state(state.as_str());
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Stop the client and close any open connection.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.state_tx.send_replace(ClientState::ShuttingDown);
        metrics::set_client_state(ClientState::ShuttingDown.as_str());
        if let Some(session) = self.session.take() {
            session.proto.close().await;
        }
        info!("Remote log client shut down");
    }

    /// Return the next event, connecting first if needed.
    ///
    /// Blocks until an event arrives. Returns `Err(Shutdown)` once shutdown
    /// has been requested, and protocol faults as they occur.
    pub async fn extract(&mut self) -> Result<ReplicatedEvent> {
        loop {
            if self.shutdown_requested() {
                self.session = None;
                self.state_tx.send_replace(ClientState::ShuttingDown);
                return Err(ReplicationError::Shutdown);
            }

            if let Some(event) = self.pending.pop_front() {
                if !event.is_control() {
                    self.last_delivered = Some(event.header.clone());
                }
                return Ok(event);
            }

            if self.session.is_none() {
                match self.connect().await {
                    Ok(()) => {}
                    Err(ReplicationError::Shutdown) => continue,
                    Err(e) => return Err(e),
                }
            }

            match self.read_next().await {
                Ok(()) => {}
                Err(ReplicationError::Shutdown) => continue,
                Err(e) if e.is_retryable() => {
                    if self.shutdown_requested() {
                        continue;
                    }
                    self.on_read_failure(e);
                }
                Err(e) => {
                    let uri = self.session.as_ref().map(|s| s.uri.to_string()).unwrap_or_default();
                    warn!(uri = %uri, error = %e, "Protocol fault; closing connection");
                    metrics::record_error("remote_client", "protocol_fault");
                    if let Some(session) = self.session.take() {
                        session.proto.close().await;
                    }
                    self.set_state(ClientState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    fn on_read_failure(&mut self, error: ReplicationError) {
        let uri = self.session.as_ref().map(|s| s.uri.to_string()).unwrap_or_default();
        let last_seqno = self.last_received.as_ref().map(|h| h.seqno);
        warn!(
            uri = %uri,
            last_seqno = ?last_seqno,
            error = %error,
            "Read from log server failed; reconnecting"
        );

        let notice = OutOfSequenceNotice {
            uri: uri.clone(),
            last_seqno,
            reason: error.to_string(),
        };
        if self.notice_tx.send(notice).is_err() {
            trace!("No listener for reconnect notifications");
        }

        metrics::record_client_reconnect(&uri);
        // Dropping the session closes the socket.
        self.session = None;
        self.set_state(ClientState::Reconnecting);
    }

    /// Run `fut` unless shutdown is requested first.
    async fn guarded<T>(
        shutdown: &mut watch::Receiver<bool>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            result = fut => result,
            _ = wait_for_shutdown(shutdown) => Err(ReplicationError::Shutdown),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connecting
    // ═══════════════════════════════════════════════════════════════════════════

    async fn connect(&mut self) -> Result<()> {
        self.set_state(ClientState::Connecting);
        let mut shutdown = self.shutdown_rx.clone();
        let mut role_skips = 0usize;
        let mut failures = 0u64;

        loop {
            if self.shutdown_requested() {
                return Err(ReplicationError::Shutdown);
            }

            let uri = self.rotator.next_uri().clone();
            let target = ConnectTarget {
                uri: uri.clone(),
                connector: self.connector.clone(),
                tls_server_name: self.config.tls.as_ref().and_then(|t| t.server_name.clone()),
                connect_timeout: self.retry.connection_timeout,
                read_timeout: self.config.read_timeout(),
            };
            let opened = Self::guarded(&mut shutdown, target.open()).await;

            let error = match opened {
                Ok((proto, caps)) => {
                    let role_ok = match &self.config.preferred_role {
                        None => true,
                        Some(role) => *role == caps.role || role_skips >= self.rotator.len(),
                    };
                    if !role_ok {
                        role_skips += 1;
                        self.stats.record_role_mismatch();
                        metrics::record_connect_attempt(&uri.to_string(), "role_mismatch");
                        debug!(
                            uri = %uri,
                            role = %caps.role,
                            preferred = ?self.config.preferred_role,
                            iterations = self.rotator.iterations(),
                            "Skipping server with non-preferred role"
                        );
                        proto.close().await;
                        continue;
                    }

                    match Self::guarded(&mut shutdown, self.handshake(proto, uri.clone(), caps)).await {
                        Ok(()) => {
                            self.stats.record_success();
                            metrics::record_connect_attempt(&uri.to_string(), "success");
                            self.set_state(ClientState::Connected);
                            return Ok(());
                        }
                        Err(e) if e.is_retryable() => e,
                        Err(e) => {
                            if !matches!(e, ReplicationError::Shutdown) {
                                warn!(uri = %uri, error = %e, "Handshake failed");
                                self.set_state(ClientState::Disconnected);
                            }
                            return Err(e);
                        }
                    }
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            failures += 1;
            let outcome = self.stats.record_failure(&error);
            metrics::record_connect_attempt(&uri.to_string(), outcome);
            if self.retry.should_warn(failures) {
                warn!(
                    uri = %uri,
                    attempts = failures,
                    timeouts = self.stats.timeouts,
                    io_errors = self.stats.io_errors,
                    error = %error,
                    "Unable to connect to log server; still retrying"
                );
            } else {
                debug!(uri = %uri, attempt = failures, error = %error, "Connect attempt failed");
            }

            let delay = self.retry.delay_for_attempt(failures);
            Self::guarded(&mut shutdown, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
    }

    async fn handshake(&mut self, mut proto: ProtocolClient, uri: LogUri, server: Capabilities) -> Result<()> {
        let (last_epoch, last_seqno) = if self.config.check_serialization {
            match &self.last_received {
                Some(h) => (h.epoch_number, Some(h.seqno)),
                None => (self.seed_epoch, None),
            }
        } else {
            (self.seed_epoch, None)
        };

        let response = HandshakeResponse {
            source_id: self.config.source_id.clone(),
            last_epoch,
            last_seqno,
            heartbeat_interval_ms: self.config.heartbeat_interval_duration().as_millis() as u64,
            resume_event_id: self.resume_event_id.clone(),
        };
        let range = proto.complete_handshake(response).await?;

        let expected_first = match (&self.last_received, &self.resume_event_id) {
            (Some(_), _) => None,
            (None, Some(_)) => Some(0),
            (None, None) => Some(range.min_seqno.unwrap_or(0)),
        };

        info!(
            uri = %uri,
            server = %server.source_id,
            role = %server.role,
            min_seqno = ?range.min_seqno,
            max_seqno = ?range.max_seqno,
            resume_seqno = ?range.resume_seqno,
            "Connected to log server"
        );

        self.session = Some(Session {
            proto,
            uri,
            server,
            range,
            expected_first,
            window: None,
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reading
    // ═══════════════════════════════════════════════════════════════════════════

    fn next_request_seqno(&self, range: &SeqnoRange) -> u64 {
        let natural = self.last_received.as_ref().map(|h| h.next_request_seqno());
        let resume = self.resume_event_id.as_ref().and(range.resume_seqno);
        match (resume, natural) {
            (Some(r), Some(n)) => r.max(n),
            (Some(r), None) => r,
            (None, Some(n)) => n,
            (None, None) => range.min_seqno.unwrap_or(0),
        }
    }

    /// Read one frame into `pending`, requesting a new window when due.
    async fn read_next(&mut self) -> Result<()> {
        let prefetch = self.config.prefetch_range.max(1);
        let mut shutdown = self.shutdown_rx.clone();

        let due = match &self.session {
            Some(session) if session.window.is_none() => Some(session.range),
            Some(_) => None,
            None => return Err(ReplicationError::Internal("read without a session".to_string())),
        };
        if let Some(range) = due {
            let seqno = self.next_request_seqno(&range);
            if let Some(session) = self.session.as_mut() {
                Self::guarded(&mut shutdown, session.proto.request_events(seqno, prefetch)).await?;
                session.window = Some(0);
                trace!(seqno, prefetch, "Requested events");
            }
        }

        let Some(session) = self.session.as_mut() else {
            return Err(ReplicationError::Internal("read without a session".to_string()));
        };
        let events = Self::guarded(&mut shutdown, session.proto.read_events()).await?;
        metrics::record_events_received(events.len());

        for event in events {
            if let Some(session) = self.session.as_mut() {
                let received = session.window.unwrap_or(0).saturating_add(1);
                // Mirrors the server: a window ends on a last fragment once
                // the prefetch count is reached.
                session.window = if received >= prefetch && event.last_frag() {
                    None
                } else {
                    Some(received)
                };
            }
            self.accept_event(event)?;
        }
        Ok(())
    }

    fn accept_event(&mut self, event: ReplicatedEvent) -> Result<()> {
        if let Some(last) = &self.last_received {
            if event.header.position_cmp(last) != Ordering::Greater {
                trace!(
                    seqno = event.seqno(),
                    fragno = event.fragno(),
                    "Skipping fragment already received"
                );
                return Ok(());
            }
            if !last.last_frag {
                if event.seqno() == last.seqno && event.fragno() == last.fragno + 1 {
                    self.push_event(event);
                    return Ok(());
                }
                return Err(ReplicationError::OutOfSequence {
                    expected: last.seqno,
                    actual: event.seqno(),
                });
            }
        }

        let expected = match &self.last_received {
            Some(last) => last.seqno + 1,
            None => self
                .session
                .as_ref()
                .and_then(|s| s.expected_first)
                .unwrap_or_else(|| event.seqno()),
        };

        if event.fragno() != 0 || event.seqno() < expected {
            return Err(ReplicationError::OutOfSequence {
                expected,
                actual: event.seqno(),
            });
        }

        if event.seqno() > expected {
            let Some(event_id) = self.resume_event_id.take() else {
                return Err(ReplicationError::OutOfSequence {
                    expected,
                    actual: event.seqno(),
                });
            };
            let through_seqno = event.seqno() - 1;
            info!(
                resume_event_id = %event_id,
                from_seqno = expected,
                through_seqno,
                "Bridging resume gap with filtered range"
            );
            metrics::record_resume_gap(through_seqno - expected + 1);
            metrics::record_control_marker("filtered_range");

            let mut snapshot = event.header.clone();
            snapshot.seqno = through_seqno;
            snapshot.fragno = 0;
            snapshot.last_frag = true;
            let marker = ControlMarker::new(ControlKind::FilteredRange { through_seqno }, expected, snapshot);
            self.pending.push_back(ReplicatedEvent::from_marker(marker));
        }

        self.resume_event_id = None;
        self.push_event(event);
        Ok(())
    }

    fn push_event(&mut self, event: ReplicatedEvent) {
        self.last_received = Some(event.header.clone());
        self.pending.push_back(event);
    }
}

/// Everything needed to open one connection, detached from the client so
/// the connect future does not borrow it.
struct ConnectTarget {
    uri: LogUri,
    connector: Option<TlsConnector>,
    tls_server_name: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ConnectTarget {
    /// Open a transport and read the server's capabilities.
    async fn open(self) -> Result<(ProtocolClient, Capabilities)> {
        let uri = &self.uri;
        let connect_timeout = self.connect_timeout;
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(uri.socket_addr()))
            .await
            .map_err(|_| ReplicationError::timeout("connect", connect_timeout))?
            .map_err(|e| ReplicationError::io("connect", e))?;
        let _ = tcp.set_nodelay(true);

        let stream: BoxedStream = if uri.use_tls {
            let connector = self.connector.as_ref().ok_or_else(|| {
                ReplicationError::Config(format!("no TLS connector for {}", uri))
            })?;
            let name = self.tls_server_name.clone().unwrap_or_else(|| uri.host.clone());
            let server_name = tls::server_name(&name)?;
            let tls_stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| ReplicationError::timeout("tls_connect", connect_timeout))?
                .map_err(|e| ReplicationError::io("tls_connect", e))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let mut proto = ProtocolClient::new(
            FramedConnection::new(stream, uri.to_string()),
            self.read_timeout,
        );
        let caps = proto.read_capabilities().await?;
        Ok((proto, caps))
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped: the client is gone, never resolve.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;

    fn client() -> RemoteLogClient {
        RemoteLogClient::new(RemoteClientConfig::for_testing(vec![
            "plain://127.0.0.1:1".to_string(),
        ]))
        .unwrap()
    }

    fn event(seqno: u64, fragno: u16, last_frag: bool) -> ReplicatedEvent {
        let header = Header {
            fragno,
            last_frag,
            ..Header::new(seqno, "src", 1)
        };
        ReplicatedEvent::new(header, Payload::Empty)
    }

    #[test]
    fn test_secure_uri_requires_tls() {
        let config = RemoteClientConfig::for_testing(vec!["secure://db1:2112".to_string()]);
        assert!(matches!(
            RemoteLogClient::new(config),
            Err(ReplicationError::Config(_))
        ));
    }

    #[test]
    fn test_empty_uri_list_rejected() {
        assert!(RemoteLogClient::new(RemoteClientConfig::for_testing(Vec::new())).is_err());
    }

    #[test]
    fn test_initial_state() {
        let client = client();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.last_position().is_none());
        assert!(client.connected_server().is_none());
    }

    #[test]
    fn test_accept_skips_duplicate_fragments() {
        let mut client = client();
        client.set_last_position(event(10, 1, false).header);

        client.accept_event(event(10, 0, false)).unwrap();
        client.accept_event(event(10, 1, false)).unwrap();
        assert!(client.pending.is_empty());

        client.accept_event(event(10, 2, true)).unwrap();
        client.accept_event(event(11, 0, true)).unwrap();
        let seqnos: Vec<_> = client.pending.iter().map(|e| (e.seqno(), e.fragno())).collect();
        assert_eq!(seqnos, vec![(10, 2), (11, 0)]);
    }

    #[test]
    fn test_accept_rejects_gap_without_resume() {
        let mut client = client();
        client.set_last_position(event(10, 0, true).header);
        let err = client.accept_event(event(13, 0, true)).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::OutOfSequence {
                expected: 11,
                actual: 13
            }
        ));
    }

    #[test]
    fn test_accept_rejects_interleaved_fragment() {
        let mut client = client();
        client.set_last_position(event(10, 0, false).header);
        assert!(client.accept_event(event(11, 0, true)).is_err());
    }

    #[test]
    fn test_resume_gap_queues_filtered_range_first() {
        let mut client = client();
        client.set_last_position(event(10, 0, true).header);
        client.resume_from("mysql-bin.000002:4");

        client.accept_event(event(15, 0, true)).unwrap();
        assert!(client.resume_event_id.is_none());
        assert_eq!(client.pending.len(), 2);

        let marker = client.pending[0].control().unwrap().clone();
        assert_eq!(marker.kind, ControlKind::FilteredRange { through_seqno: 14 });
        assert_eq!(marker.seqno, 11);
        assert_eq!(client.pending[0].seqno(), 11);
        assert_eq!(client.pending[1].seqno(), 15);
    }

    #[test]
    fn test_resume_without_gap_clears_request() {
        let mut client = client();
        client.set_last_position(event(10, 0, true).header);
        client.resume_from("mysql-bin.000002:4");
        client.accept_event(event(11, 0, true)).unwrap();
        assert!(client.resume_event_id.is_none());
        assert_eq!(client.pending.len(), 1);
    }

    #[test]
    fn test_next_request_seqno() {
        let mut client = client();
        let range = SeqnoRange {
            min_seqno: Some(5),
            max_seqno: Some(50),
            resume_seqno: None,
        };
        assert_eq!(client.next_request_seqno(&range), 5);

        client.set_last_position(event(20, 1, false).header);
        assert_eq!(client.next_request_seqno(&range), 20);

        client.set_last_position(event(20, 2, true).header);
        assert_eq!(client.next_request_seqno(&range), 21);

        client.resume_from("pos");
        let resumed = SeqnoRange {
            resume_seqno: Some(30),
            ..range
        };
        assert_eq!(client.next_request_seqno(&resumed), 30);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_connect_retries() {
        let mut client = client().with_retry(RetryConfig::testing());
        let handle = client.shutdown_handle();
        let mut states = client.state_receiver();

        let task = tokio::spawn(async move { client.extract().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        assert!(handle.is_shutdown());

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("extract should return after shutdown")
            .unwrap();
        assert!(matches!(result, Err(ReplicationError::Shutdown)));
        assert_eq!(*states.borrow_and_update(), ClientState::ShuttingDown);
    }
}
