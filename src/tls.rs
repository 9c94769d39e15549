// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TLS setup for `secure://` URIs (rustls with the ring provider).

use crate::config::{ClientTlsConfig, TlsConfig};
use crate::error::{ReplicationError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| ReplicationError::Tls(format!("cannot read {}: {}", path, e)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ReplicationError::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ReplicationError::Tls("no certificates found in PEM".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ReplicationError::Tls(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| ReplicationError::Tls("no private key found in PEM".to_string()))
}

/// Server config from in-memory PEM.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_key(key_pem)?;
    let provider = rustls::crypto::ring::default_provider();
    let config = ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .map_err(|e| ReplicationError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ReplicationError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client config trusting the CAs in `ca_pem`.
pub fn client_config_from_pem(ca_pem: &[u8]) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| ReplicationError::Tls(format!("invalid CA certificate: {}", e)))?;
    }
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .map_err(|e| ReplicationError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let server = server_config_from_pem(&read_pem(&config.cert_path)?, &read_pem(&config.key_path)?)?;
    Ok(TlsAcceptor::from(server))
}

pub fn connector(config: &ClientTlsConfig) -> Result<TlsConnector> {
    let client = client_config_from_pem(&read_pem(&config.ca_path)?)?;
    Ok(TlsConnector::from(client))
}

/// Name to verify against the server certificate.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| ReplicationError::Tls(format!("invalid server name {}: {}", name, e)))
}
