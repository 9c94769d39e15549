// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Handshake validation policies.

use crate::config::ValidatorKind;
use std::sync::Arc;

/// What the server knows when judging a client's handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFacts {
    pub min_seqno: Option<u64>,
    pub max_seqno: Option<u64>,
    pub client_last_seqno: Option<u64>,
    pub client_last_epoch: u64,
    /// Epoch the server log holds at the client's last seqno, when stored.
    pub server_epoch_at_last: Option<u64>,
}

/// Decides whether a client may start reading.
pub trait HandshakeValidator: Send + Sync {
    /// `Err(reason)` rejects the client with NOK.
    fn validate(&self, facts: &HandshakeFacts) -> std::result::Result<(), String>;

    fn name(&self) -> &'static str;
}

/// Build the configured validator.
pub fn build_validator(kind: ValidatorKind) -> Arc<dyn HandshakeValidator> {
    match kind {
        ValidatorKind::Strict => Arc::new(StrictValidator),
        ValidatorKind::SeqnoOnly => Arc::new(SeqnoOnlyValidator),
        ValidatorKind::AcceptAll => Arc::new(AcceptAllValidator),
    }
}

fn check_seqno_range(facts: &HandshakeFacts) -> std::result::Result<(), String> {
    let Some(last) = facts.client_last_seqno else {
        return Ok(());
    };

    match facts.max_seqno {
        None => {
            return Err(format!(
                "client seqno {} is ahead of an empty server log",
                last
            ))
        }
        Some(max) if last > max => {
            return Err(format!(
                "client seqno {} is ahead of server max seqno {}",
                last, max
            ))
        }
        Some(_) => {}
    }

    if let Some(min) = facts.min_seqno {
        if last.saturating_add(1) < min {
            return Err(format!(
                "client next seqno {} has been purged (server min seqno {})",
                last.saturating_add(1),
                min
            ));
        }
    }

    Ok(())
}

/// Seqno range plus epoch consistency at the client's last seqno.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictValidator;

impl HandshakeValidator for StrictValidator {
    fn validate(&self, facts: &HandshakeFacts) -> std::result::Result<(), String> {
        check_seqno_range(facts)?;

        if let (Some(last), Some(server_epoch)) = (facts.client_last_seqno, facts.server_epoch_at_last) {
            if server_epoch != facts.client_last_epoch {
                return Err(format!(
                    "epoch mismatch at seqno {}: client {} server {}",
                    last, facts.client_last_epoch, server_epoch
                ));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "strict"
    }
}

/// Seqno range only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqnoOnlyValidator;

impl HandshakeValidator for SeqnoOnlyValidator {
    fn validate(&self, facts: &HandshakeFacts) -> std::result::Result<(), String> {
        check_seqno_range(facts)
    }

    fn name(&self) -> &'static str {
        "seqno_only"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

impl HandshakeValidator for AcceptAllValidator {
    fn validate(&self, _facts: &HandshakeFacts) -> std::result::Result<(), String> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "accept_all"
    }
}
