// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server side of the protocol: one instance per connected client.

use super::{
    Capabilities, FramedConnection, HandshakeFacts, HandshakeResponse, HandshakeValidator,
    Message, SeqnoRange,
};
use crate::error::{ReplicationError, Result};
use crate::event::ReplicatedEvent;
use crate::log_store::{LogConnection, LogStore, SeekPosition};
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Heartbeat interval used when a client asks for 0.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(3);

/// Server identity and streaming settings shared by all handlers.
#[derive(Clone)]
pub struct ServerSettings {
    pub source_id: String,
    pub role: String,
    pub version: String,
    /// Events per batch frame; 1 disables batching.
    pub buffer_size: usize,
    pub validator: Arc<dyn HandshakeValidator>,
}

/// Serves one client from the shared log.
pub struct ProtocolServer {
    conn: FramedConnection,
    log: Arc<dyn LogStore>,
    settings: ServerSettings,
    client: Option<HandshakeResponse>,
    reader: Option<Box<dyn LogConnection>>,
    /// Seqno the reader is positioned at after the previous window.
    reader_next: Option<u64>,
    pending: Vec<ReplicatedEvent>,
}

impl ProtocolServer {
    pub fn new(conn: FramedConnection, log: Arc<dyn LogStore>, settings: ServerSettings) -> Self {
        Self {
            conn,
            log,
            settings,
            client: None,
            reader: None,
            reader_next: None,
            pending: Vec::new(),
        }
    }

    /// Client identity after a successful handshake.
    pub fn client(&self) -> Option<&HandshakeResponse> {
        self.client.as_ref()
    }

    /// Run the handshake and then serve event requests until the client
    /// disconnects or a fault occurs.
    pub async fn run(&mut self) -> Result<()> {
        self.handshake().await?;
        self.serve().await
    }

    /// Send capabilities, validate the response and answer OK or NOK.
    pub async fn handshake(&mut self) -> Result<HandshakeResponse> {
        let min_seqno = self.log.min_seqno().await?;
        let max_seqno = self.log.max_seqno().await?;
        let capabilities = Capabilities {
            source_id: self.settings.source_id.clone(),
            role: self.settings.role.clone(),
            version: self.settings.version.clone(),
            min_seqno,
            max_seqno,
        };
        self.conn.send(&Message::Handshake(capabilities)).await?;

        let response = match self.conn.recv().await? {
            Message::HandshakeResponse(response) => response,
            other => {
                return Err(ReplicationError::Protocol(format!(
                    "expected handshake_response, received {}",
                    other.kind()
                )))
            }
        };

        let server_epoch_at_last = match response.last_seqno {
            Some(seqno) => epoch_at(&self.log, seqno).await?,
            None => None,
        };
        let facts = HandshakeFacts {
            min_seqno,
            max_seqno,
            client_last_seqno: response.last_seqno,
            client_last_epoch: response.last_epoch,
            server_epoch_at_last,
        };

        if let Err(reason) = self.settings.validator.validate(&facts) {
            return self.reject(&response, reason).await;
        }

        let resume_seqno = match &response.resume_event_id {
            Some(event_id) => match locate_event_id(&self.log, event_id).await? {
                Some(seqno) => Some(seqno),
                None => {
                    let reason = format!("resume event id {} not found in log", event_id);
                    return self.reject(&response, reason).await;
                }
            },
            None => None,
        };

        self.conn
            .send(&Message::Ok(SeqnoRange {
                min_seqno,
                max_seqno,
                resume_seqno,
            }))
            .await?;

        info!(
            peer = %self.conn.peer(),
            client = %response.source_id,
            last_seqno = ?response.last_seqno,
            resume_seqno = ?resume_seqno,
            validator = self.settings.validator.name(),
            "Client handshake accepted"
        );
        self.client = Some(response.clone());
        Ok(response)
    }

    async fn reject(&mut self, response: &HandshakeResponse, reason: String) -> Result<HandshakeResponse> {
        warn!(
            peer = %self.conn.peer(),
            client = %response.source_id,
            reason = %reason,
            "Rejecting client handshake"
        );
        metrics::record_handshake_rejected(self.settings.validator.name());
        self.conn
            .send(&Message::Nok {
                reason: reason.clone(),
            })
            .await?;
        Err(ReplicationError::HandshakeRejected { reason })
    }

    /// Answer event requests until the client goes away.
    pub async fn serve(&mut self) -> Result<()> {
        let heartbeat = self
            .client
            .as_ref()
            .map(|c| Duration::from_millis(c.heartbeat_interval_ms))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_HEARTBEAT);

        loop {
            let (seqno, prefetch_range) = match self.conn.recv().await? {
                Message::EventRequest {
                    seqno,
                    prefetch_range,
                } => (seqno, prefetch_range),
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "expected event_request, received {}",
                        other.kind()
                    )))
                }
            };

            debug!(peer = %self.conn.peer(), seqno, prefetch_range, "Event request");
            self.send_window(seqno, prefetch_range.max(1), heartbeat).await?;
        }
    }

    async fn position_reader(&mut self, seqno: u64) -> Result<()> {
        if self.reader.is_some() && self.reader_next == Some(seqno) {
            return Ok(());
        }

        if let Some(min) = self.log.min_seqno().await? {
            if seqno < min {
                return self
                    .fail_request(format!(
                        "requested seqno {} is below log minimum {}",
                        seqno, min
                    ))
                    .await;
            }
        }

        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => self.log.connect(true).await?,
        };
        if !reader.seek(SeekPosition::Seqno(seqno)).await? {
            return self
                .fail_request(format!("requested seqno {} is not in the log", seqno))
                .await;
        }
        self.reader = Some(reader);
        self.reader_next = Some(seqno);
        Ok(())
    }

    /// Stream one window. The window is only closed on a transaction boundary.
    async fn send_window(&mut self, seqno: u64, prefetch_range: u32, heartbeat: Duration) -> Result<()> {
        self.position_reader(seqno).await?;

        let mut sent: u32 = 0;
        let mut at_boundary = true;
        while sent < prefetch_range || !at_boundary {
            let Some(reader) = self.reader.as_mut() else {
                return Err(ReplicationError::Internal("log reader not positioned".to_string()));
            };

            let next = tokio::time::timeout(heartbeat, reader.next(true)).await;
            match next {
                Ok(Ok(Some(event))) => {
                    sent = sent.saturating_add(1);
                    at_boundary = event.last_frag();
                    self.reader_next = Some(event.header.next_request_seqno());
                    self.pending.push(event);
                    if self.pending.len() >= self.settings.buffer_size.max(1) {
                        self.flush().await?;
                    }
                }
                Ok(Ok(None)) => {
                    self.flush().await?;
                    return self.fail_request("log closed".to_string()).await;
                }
                Ok(Err(e)) => {
                    self.flush().await?;
                    self.reader = None;
                    return self.fail_request(e.to_string()).await;
                }
                Err(_) => {
                    self.flush().await?;
                    self.conn.send(&Message::Heartbeat).await?;
                    metrics::record_heartbeat_sent();
                }
            }
        }

        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let count = self.pending.len();
        let message = if self.settings.buffer_size <= 1 && count == 1 {
            match self.pending.pop() {
                Some(event) => Message::Event(event),
                None => return Ok(()),
            }
        } else {
            Message::EventBatch(std::mem::take(&mut self.pending))
        };
        self.conn.send(&message).await?;

        let client_id = self.client.as_ref().map(|c| c.source_id.as_str()).unwrap_or("");
        metrics::record_events_sent(client_id, count);
        Ok(())
    }

    /// Send an error frame in reply to a request; the session ends.
    async fn fail_request<T>(&mut self, reason: String) -> Result<T> {
        warn!(peer = %self.conn.peer(), reason = %reason, "Event request failed");
        self.conn
            .send(&Message::Nok {
                reason: reason.clone(),
            })
            .await?;
        Err(ReplicationError::ServerFault { reason })
    }
}

async fn epoch_at(log: &Arc<dyn LogStore>, seqno: u64) -> Result<Option<u64>> {
    let mut conn = log.connect(true).await?;
    if !conn.seek(SeekPosition::Seqno(seqno)).await? {
        return Ok(None);
    }
    Ok(conn
        .next(false)
        .await?
        .filter(|e| e.seqno() == seqno)
        .map(|e| e.header.epoch_number))
}

async fn locate_event_id(log: &Arc<dyn LogStore>, event_id: &str) -> Result<Option<u64>> {
    let mut conn = log.connect(true).await?;
    if !conn.seek(SeekPosition::EventId(event_id.to_string())).await? {
        return Ok(None);
    }
    Ok(conn.next(false).await?.map(|e| e.seqno()))
}
