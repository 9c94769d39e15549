// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: log server and remote client over loopback TCP, and
//! the dispatch → apply → commit pipeline.
//!
//! Run with: cargo test --test integration

mod common;

use common::*;
use replication_distributor::config::{ClientTlsConfig, TlsConfig};
use replication_distributor::{
    ClientState, CommitPositionTracker, CommitStoreConfig, ControlKind, DispatchConfig, Header,
    LogServerConfig, LogStore, PartitionedDispatchQueue, PartitionerConfig, RemoteClientConfig,
    RemoteLogClient, ReplicationError, SeekPosition,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn handshake_round_trip_returns_min_seqno_event() {
    let log = memory_log(10, 20).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    let first = extract_n(&mut client, 1).await.remove(0);

    let range = client.server_range().unwrap();
    assert_eq!(range.min_seqno, Some(10));
    assert_eq!(range.max_seqno, Some(20));

    let mut conn = log.connect(true).await.unwrap();
    assert!(conn.seek(SeekPosition::Seqno(10)).await.unwrap());
    let direct = conn.next(false).await.unwrap().unwrap();
    assert_eq!(first, direct);
    assert_eq!(client.connected_server().unwrap().source_id, SOURCE_ID);
    assert_eq!(client.state(), ClientState::Connected);

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_ahead_of_server_is_rejected_and_position_kept() {
    let log = memory_log(0, 500).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    client.set_last_position(Header::new(501, SOURCE_ID, 1));

    let err = client.extract().await.unwrap_err();
    assert!(matches!(err, ReplicationError::HandshakeRejected { .. }), "{}", err);
    assert!(err.is_protocol_fault());
    assert!(err.to_string().contains("501"));
    assert_eq!(client.last_position().unwrap().seqno, 501);
    assert_eq!(client.state(), ClientState::Disconnected);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn purged_position_is_rejected() {
    let log = memory_log(0, 9).await;
    let mut writer = log.connect(false).await.unwrap();
    assert_eq!(writer.delete(0, 4).await.unwrap(), 5);
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    client.set_last_position(Header::new(2, SOURCE_ID, 1));
    let err = client.extract().await.unwrap_err();
    assert!(err.to_string().contains("purged"), "{}", err);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn serialization_check_disabled_skips_position_validation() {
    let log = memory_log(0, 9).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut config = RemoteClientConfig::for_testing(vec![uri]);
    config.check_serialization = false;
    let mut client = RemoteLogClient::new(config).unwrap();
    // Far ahead of the server, but never advertised.
    client.set_last_position(Header::new(3, SOURCE_ID, 99));

    let events = extract_n(&mut client, 2).await;
    assert_eq!(seqnos(&events), vec![4, 5]);

    client.shutdown().await;
    server.stop().await.unwrap();
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn streams_all_events_across_windows() {
    let log = memory_log(0, 49).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    let events = extract_n(&mut client, 50).await;
    assert_eq!(seqnos(&events), (0..50).collect::<Vec<_>>());
    assert_eq!(client.last_position().unwrap().seqno, 49);

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unbuffered_server_streams_in_order() {
    let log = memory_log(0, 11).await;
    let mut config = LogServerConfig::for_testing(SOURCE_ID);
    config.buffer_size = 1;
    let (mut server, uri) = start_server(&log, config).await;

    let mut client = client(vec![uri]);
    let events = extract_n(&mut client, 12).await;
    assert_eq!(seqnos(&events), (0..12).collect::<Vec<_>>());

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn fragmented_transactions_arrive_whole_and_in_order() {
    let log = memory_log(0, 0).await;
    for event in fragmented_tx(1, 4) {
        log.append(event).await.unwrap();
    }
    log.append(tx(2)).await.unwrap();
    for event in fragmented_tx(3, 3) {
        log.append(event).await.unwrap();
    }
    let (mut server, uri) = start_default_server(&log).await;

    let mut config = RemoteClientConfig::for_testing(vec![uri]);
    config.prefetch_range = 2;
    let mut client = RemoteLogClient::new(config).unwrap();

    let events = extract_n(&mut client, 9).await;
    let positions: Vec<(u64, u16, bool)> = events
        .iter()
        .map(|e| (e.seqno(), e.fragno(), e.last_frag()))
        .collect();
    assert_eq!(
        positions,
        vec![
            (0, 0, true),
            (1, 0, false),
            (1, 1, false),
            (1, 2, false),
            (1, 3, true),
            (2, 0, true),
            (3, 0, false),
            (3, 1, false),
            (3, 2, true),
        ]
    );

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn tail_read_survives_idle_period_on_heartbeats() {
    let log = memory_log(0, 2).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    assert_eq!(seqnos(&extract_n(&mut client, 3).await), vec![0, 1, 2]);

    let appender = {
        let log = log.clone();
        tokio::spawn(async move {
            // Several heartbeat intervals with nothing to send.
            tokio::time::sleep(Duration::from_millis(400)).await;
            log.append(tx(3)).await.unwrap();
            log.append(tx(4)).await.unwrap();
        })
    };

    assert_eq!(seqnos(&extract_n(&mut client, 2).await), vec![3, 4]);
    assert_eq!(client.connect_stats().attempts, 1);
    appender.await.unwrap();

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_resumes_after_seeded_position() {
    let log = memory_log(0, 9).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    client.set_last_position(tx(5).header);
    assert_eq!(seqnos(&extract_n(&mut client, 3).await), vec![6, 7, 8]);

    client.shutdown().await;
    server.stop().await.unwrap();
}

// =============================================================================
// Failover
// =============================================================================

#[tokio::test]
async fn fails_over_to_next_uri_without_duplicates() {
    let log = memory_log(0, 9).await;
    let (mut primary, primary_uri) = start_default_server(&log).await;
    let (mut standby, standby_uri) = start_default_server(&log).await;

    let mut client = client(vec![primary_uri, standby_uri.clone()]);
    let mut notices = client.take_notifications().unwrap();

    let mut events = extract_n(&mut client, 4).await;
    primary.stop().await.unwrap();
    events.extend(extract_n(&mut client, 6).await);

    assert_eq!(seqnos(&events), (0..10).collect::<Vec<_>>());
    assert_eq!(client.connected_uri().unwrap().to_string(), standby_uri);

    // Prefetched events may already have been received past what was extracted.
    let notice = notices.try_recv().unwrap();
    assert!(notice.last_seqno.unwrap() >= 3, "{:?}", notice);

    client.shutdown().await;
    standby.stop().await.unwrap();
}

#[tokio::test]
async fn preferred_role_selects_matching_server() {
    let log = memory_log(0, 4).await;
    let (mut master, master_uri) = start_default_server(&log).await;
    let mut slave_config = LogServerConfig::for_testing("db2");
    slave_config.role = "slave".to_string();
    let (mut slave, slave_uri) = start_server(&log, slave_config).await;

    let mut config = RemoteClientConfig::for_testing(vec![master_uri, slave_uri]);
    config.preferred_role = Some("slave".to_string());
    let mut client = RemoteLogClient::new(config).unwrap();

    extract_n(&mut client, 1).await;
    assert_eq!(client.connected_server().unwrap().role, "slave");
    assert_eq!(client.connect_stats().role_mismatches, 1);

    client.shutdown().await;
    master.stop().await.unwrap();
    slave.stop().await.unwrap();
}

#[tokio::test]
async fn preferred_role_falls_back_after_full_rotation() {
    let log = memory_log(0, 4).await;
    let (mut a, a_uri) = start_default_server(&log).await;
    let (mut b, b_uri) = start_default_server(&log).await;

    let mut config = RemoteClientConfig::for_testing(vec![a_uri, b_uri]);
    config.preferred_role = Some("slave".to_string());
    let mut client = RemoteLogClient::new(config).unwrap();

    extract_n(&mut client, 1).await;
    assert_eq!(client.connected_server().unwrap().role, "master");
    assert_eq!(client.connect_stats().role_mismatches, 2);

    client.shutdown().await;
    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// =============================================================================
// TLS
// =============================================================================

#[tokio::test]
async fn secure_uri_streams_over_tls() {
    let dir = tempdir().unwrap();
    let files = generate_tls_files(dir.path());
    let log = memory_log(0, 4).await;

    let mut server_config = LogServerConfig::for_testing(SOURCE_ID);
    server_config.listen_uri = "secure://127.0.0.1:0".to_string();
    server_config.tls = Some(TlsConfig {
        cert_path: files.cert_path.to_string_lossy().to_string(),
        key_path: files.key_path.to_string_lossy().to_string(),
    });
    let mut server =
        replication_distributor::LogServer::new(server_config, Arc::new(log.clone())).unwrap();
    server.start().await.unwrap();
    let uri = server.connect_uri().unwrap();
    assert!(uri.starts_with("secure://"));

    let mut config = RemoteClientConfig::for_testing(vec![uri]);
    config.tls = Some(ClientTlsConfig {
        ca_path: files.ca_path.to_string_lossy().to_string(),
        server_name: Some("localhost".to_string()),
    });
    let mut client = RemoteLogClient::new(config).unwrap();

    assert_eq!(seqnos(&extract_n(&mut client, 5).await), vec![0, 1, 2, 3, 4]);
    assert!(client.connected_uri().unwrap().use_tls);

    client.shutdown().await;
    server.stop().await.unwrap();
}

// =============================================================================
// Resume from source position
// =============================================================================

#[tokio::test]
async fn resume_gap_is_bridged_with_filtered_range() {
    let log = memory_log(0, 9).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    client.resume_from(event_id(5));

    let events = extract_n(&mut client, 3).await;
    let marker = events[0].control().expect("filtered range marker first");
    assert_eq!(marker.kind, ControlKind::FilteredRange { through_seqno: 4 });
    assert_eq!(events[0].seqno(), 0);
    assert_eq!(seqnos(&events[1..]), vec![5, 6]);
    // Markers are not a delivered position.
    assert_eq!(client.last_position().unwrap().seqno, 6);

    client.shutdown().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_resume_event_id_is_rejected() {
    let log = memory_log(0, 3).await;
    let (mut server, uri) = start_default_server(&log).await;

    let mut client = client(vec![uri]);
    client.resume_from("mysql-bin.999999:0");
    let err = client.extract().await.unwrap_err();
    assert!(matches!(err, ReplicationError::HandshakeRejected { .. }), "{}", err);

    server.stop().await.unwrap();
}

// =============================================================================
// Dispatch and commit positions
// =============================================================================

#[tokio::test]
async fn restart_point_is_minimum_across_channels() {
    let dispatch = PartitionedDispatchQueue::new(&DispatchConfig::for_testing(2)).unwrap();
    let tracker = CommitPositionTracker::open(&CommitStoreConfig::in_memory(2))
        .await
        .unwrap();

    dispatch.report_processed(0, Header::new(100, SOURCE_ID, 1)).unwrap();
    tracker
        .update_last_commit_seqno(0, &Header::new(100, SOURCE_ID, 1), 0)
        .await
        .unwrap();
    assert!(dispatch.min_last_header().is_none());

    dispatch.report_processed(1, Header::new(80, SOURCE_ID, 1)).unwrap();
    tracker
        .update_last_commit_seqno(1, &Header::new(80, SOURCE_ID, 1), 0)
        .await
        .unwrap();

    assert_eq!(dispatch.min_last_header().unwrap().seqno, 80);
    assert_eq!(tracker.min_commit_seqno().await.unwrap(), Some(80));
}

#[tokio::test]
async fn reduce_refused_when_channels_disagree() {
    let dir = tempdir().unwrap();
    let config = CommitStoreConfig {
        sqlite_path: dir.path().join("positions.db").to_string_lossy().to_string(),
        channels: 2,
        wal_mode: true,
    };
    let tracker = CommitPositionTracker::open(&config).await.unwrap();
    tracker.update_last_commit_seqno(0, &Header::new(80, SOURCE_ID, 1), 0).await.unwrap();
    tracker.update_last_commit_seqno(1, &Header::new(95, SOURCE_ID, 1), 0).await.unwrap();

    assert!(!tracker.reduce_tasks(1).await.unwrap());
    assert!(!tracker.reduce_tasks(2).await.unwrap());

    let positions = tracker.all_positions().await.unwrap();
    let seqnos: Vec<Option<u64>> = positions.iter().map(|p| p.seqno()).collect();
    assert_eq!(seqnos, vec![Some(80), Some(95)]);
    tracker.close().await;

    // A single-channel restart cannot collapse them either.
    let single = CommitStoreConfig { channels: 1, ..config };
    let err = CommitPositionTracker::open(&single).await.err().unwrap();
    assert!(matches!(err, ReplicationError::ChannelCountMismatch { .. }));
}

/// Remote log → dispatch → one consumer task per partition → commit tracker.
#[tokio::test]
async fn pipeline_from_remote_log_to_commit_positions() {
    const TRANSACTIONS: u64 = 40;
    let log = memory_log(1, TRANSACTIONS).await;
    let (mut server, uri) = start_default_server(&log).await;

    let dispatch = Arc::new(
        PartitionedDispatchQueue::new(&DispatchConfig {
            partitions: 2,
            queue_capacity: 8,
            sync_interval: 10,
            partitioner: PartitionerConfig::ShardList {
                mapping: HashMap::from([("even".to_string(), 0), ("odd".to_string(), 1)]),
                critical_shards: vec!["ddl".to_string()],
                default_partition: None,
            },
            task_id: 0,
        })
        .unwrap(),
    );
    let tracker = Arc::new(
        CommitPositionTracker::open(&CommitStoreConfig::in_memory(2))
            .await
            .unwrap(),
    );

    let consumers: Vec<_> = (0..2)
        .map(|partition| {
            let queue = dispatch.queue(partition).unwrap();
            let dispatch = dispatch.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut last = 0u64;
                loop {
                    let event = queue.take().await.unwrap();
                    assert!(event.seqno() >= last, "partition {} went backward", partition);
                    last = event.seqno();
                    if let Some(marker) = event.control() {
                        if marker.kind == ControlKind::Stop {
                            return last;
                        }
                        continue;
                    }
                    if event.last_frag() {
                        tracker
                            .update_last_commit_seqno(partition as u32, &event.header, 0)
                            .await
                            .unwrap();
                        dispatch.report_processed(partition, event.header.clone()).unwrap();
                    }
                }
            })
        })
        .collect();

    let mut client = client(vec![uri]);
    for mut event in extract_n(&mut client, TRANSACTIONS as usize).await {
        event.header.shard_id = match event.seqno() {
            20 => "ddl".to_string(),
            s if s % 2 == 0 => "even".to_string(),
            _ => "odd".to_string(),
        };
        dispatch.put(event).await.unwrap();
    }
    assert!(dispatch.insert_stop().await.unwrap());

    for consumer in consumers {
        let stopped_at = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped_at, TRANSACTIONS);
    }

    assert_eq!(dispatch.transaction_count(), TRANSACTIONS);
    assert_eq!(dispatch.in_flight(), 0);
    let restart = tracker.min_commit_seqno().await.unwrap().unwrap();
    assert_eq!(restart, TRANSACTIONS - 1);
    assert_eq!(dispatch.min_last_header().unwrap().seqno, TRANSACTIONS - 1);

    client.shutdown().await;
    server.stop().await.unwrap();
}
