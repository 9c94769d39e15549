// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log server URIs and failover rotation.
//!
//! ```text
//! plain://db1.example.com:2112    plain TCP
//! secure://db1.example.com        TLS, default port 2112
//! plain://[::1]:2113              IPv6 literal
//! ```

use crate::error::{ReplicationError, Result};
use std::fmt;
use std::str::FromStr;

/// Port used when a URI omits one.
pub const DEFAULT_PORT: u16 = 2112;

/// A parsed log server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogUri {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl LogUri {
    /// Parse `plain://host[:port]` or `secure://host[:port]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ReplicationError::Config(format!("URI has no scheme: {}", uri)))?;

        let use_tls = match scheme {
            "plain" => false,
            "secure" => true,
            other => {
                return Err(ReplicationError::Config(format!(
                    "Unsupported URI scheme '{}' (expected plain or secure): {}",
                    other, uri
                )))
            }
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() {
            return Err(ReplicationError::Config(format!("URI has no host: {}", uri)));
        }

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            // IPv6 literal
            let (host, tail) = stripped.split_once(']').ok_or_else(|| {
                ReplicationError::Config(format!("Unterminated IPv6 literal: {}", uri))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, uri)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(ReplicationError::Config(format!("Malformed URI: {}", uri)))
                }
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), parse_port(p, uri)?),
                None => (authority.to_string(), DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(ReplicationError::Config(format!("URI has no host: {}", uri)));
        }
        if host.contains(['[', ']']) {
            return Err(ReplicationError::Config(format!("Malformed host in URI: {}", uri)));
        }

        Ok(Self { host, port, use_tls })
    }

    /// `host:port` suitable for `TcpStream::connect` / `TcpListener::bind`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, uri: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|e| ReplicationError::Config(format!("Invalid port in {}: {}", uri, e)))
}

impl FromStr for LogUri {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LogUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "secure" } else { "plain" };
        write!(f, "{}://{}", scheme, self.socket_addr())
    }
}

/// Round-robin iterator over candidate server URIs.
///
/// `iterations()` counts completed passes over the list, which the client
/// uses to decide when to stop insisting on a preferred role.
#[derive(Debug, Clone)]
pub struct ConnectionUriRotator {
    uris: Vec<LogUri>,
    index: usize,
    iterations: u64,
}

impl ConnectionUriRotator {
    /// Create a rotator. The list must not be empty.
    pub fn new(uris: Vec<LogUri>) -> Result<Self> {
        if uris.is_empty() {
            return Err(ReplicationError::Config(
                "At least one server URI is required".to_string(),
            ));
        }
        Ok(Self {
            uris,
            index: 0,
            iterations: 0,
        })
    }

    /// Parse and build from URI strings.
    pub fn from_strs<S: AsRef<str>>(uris: &[S]) -> Result<Self> {
        let parsed = uris
            .iter()
            .map(|u| LogUri::parse(u.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(parsed)
    }

    /// Return the next candidate, wrapping around at the end of the list.
    pub fn next_uri(&mut self) -> &LogUri {
        let current = self.index;
        self.index += 1;
        if self.index >= self.uris.len() {
            self.index = 0;
            self.iterations += 1;
        }
        &self.uris[current]
    }

    /// Number of completed passes over the list.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn uris(&self) -> &[LogUri] {
        &self.uris
    }
}
