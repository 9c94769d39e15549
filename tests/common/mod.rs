//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Event and transaction builders
//! - Pre-filled in-memory logs and loopback log servers
//! - Throwaway TLS material (CA + leaf) written to a temp dir

#![allow(dead_code)]

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use replication_distributor::{
    event::ChangeData, Header, LogServer, LogServerConfig, MemoryLogStore, Payload,
    RemoteClientConfig, RemoteLogClient, ReplicatedEvent,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const SOURCE_ID: &str = "db1";

/// Opaque source position for `seqno`. Fixed width so ids sort like seqnos.
pub fn event_id(seqno: u64) -> String {
    format!("mysql-bin.000001:{:010}", seqno * 100)
}

/// One fragment of transaction `seqno`.
pub fn fragment(seqno: u64, fragno: u16, last_frag: bool) -> ReplicatedEvent {
    let mut header = Header::new(seqno, SOURCE_ID, 1);
    header.fragno = fragno;
    header.last_frag = last_frag;
    header.event_id = event_id(seqno);
    header.shard_id = "sales".to_string();
    ReplicatedEvent::new(
        header,
        Payload::Change(vec![ChangeData::Statement {
            schema: Some("sales".to_string()),
            query: format!("UPDATE orders SET status = 'shipped' WHERE id = {}", seqno),
        }]),
    )
}

/// Single-fragment transaction.
pub fn tx(seqno: u64) -> ReplicatedEvent {
    fragment(seqno, 0, true)
}

/// All fragments of a transaction split `count` ways.
pub fn fragmented_tx(seqno: u64, count: u16) -> Vec<ReplicatedEvent> {
    (0..count).map(|f| fragment(seqno, f, f + 1 == count)).collect()
}

/// Log holding single-fragment transactions `first..=last`.
pub async fn memory_log(first: u64, last: u64) -> MemoryLogStore {
    let log = MemoryLogStore::starting_at(first);
    for seqno in first..=last {
        log.append(tx(seqno)).await.unwrap();
    }
    log
}

/// Start a plain log server over `log`; returns it with its connect URI.
pub async fn start_server(log: &MemoryLogStore, config: LogServerConfig) -> (LogServer, String) {
    let mut server = LogServer::new(config, Arc::new(log.clone())).unwrap();
    let addr = server.start().await.unwrap();
    (server, format!("plain://{}", addr))
}

pub async fn start_default_server(log: &MemoryLogStore) -> (LogServer, String) {
    start_server(log, LogServerConfig::for_testing(SOURCE_ID)).await
}

pub fn client(uris: Vec<String>) -> RemoteLogClient {
    RemoteLogClient::new(RemoteClientConfig::for_testing(uris)).unwrap()
}

/// Extract `count` events, failing the test if it takes longer than 5s.
pub async fn extract_n(client: &mut RemoteLogClient, count: usize) -> Vec<ReplicatedEvent> {
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let event = tokio::time::timeout(Duration::from_secs(5), client.extract())
            .await
            .expect("extract timed out")
            .expect("extract failed");
        events.push(event);
    }
    events
}

pub fn seqnos(events: &[ReplicatedEvent]) -> Vec<u64> {
    events.iter().map(|e| e.seqno()).collect()
}

/// PEM files for a CA and a `localhost` / 127.0.0.1 leaf signed by it.
pub struct TlsFiles {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub fn generate_tls_files(dir: &Path) -> TlsFiles {
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "distributor-test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().expect("ca key");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let mut leaf_params = CertificateParams::default();
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "log-server");
    leaf_params.subject_alt_names = vec![
        SanType::DnsName("localhost".try_into().unwrap()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    leaf_params.is_ca = IsCa::NoCa;
    leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("leaf cert");

    let files = TlsFiles {
        ca_path: dir.join("ca.pem"),
        cert_path: dir.join("server.pem"),
        key_path: dir.join("server.key"),
    };
    std::fs::write(&files.ca_path, ca_cert.pem()).expect("write ca");
    std::fs::write(&files.cert_path, leaf_cert.pem()).expect("write cert");
    std::fs::write(&files.key_path, leaf_key.serialize_pem()).expect("write key");
    files
}
