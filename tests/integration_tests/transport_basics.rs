// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serial_test::serial;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::fast_config;
use rednet_explorer::{
    bus::loopback::LoopbackHub,
    collab::AllowAllGuard,
    error::CoreError,
    peers::{connection::ConnState, registry::PeerRegistry},
    proto::{codec::Codec, envelope::NodeId},
    transport::adapter::{SendOptions, Transport},
};

fn spawn_transport(
    hub: &Arc<LoopbackHub>,
    id: NodeId,
    cancel: CancellationToken,
) -> Arc<Transport> {
    let cfg = fast_config();
    let (bus, frames) = hub.attach(id);
    let codec = Arc::new(Codec::new(id, &cfg));
    let registry = PeerRegistry::new(id, cfg.peers.clone(), cfg.transport.inbound_queue);
    let (transport, _dispatch) = Transport::start(
        codec,
        bus,
        frames,
        registry,
        Arc::new(AllowAllGuard),
        &cfg,
        cancel,
    );
    transport
}

#[tokio::test]
#[serial]
async fn test_ping_pong_opens_connection() -> Result<()> {
    let hub = LoopbackHub::new();
    let cancel = CancellationToken::new();
    let a = spawn_transport(&hub, 1, cancel.child_token());
    let _b = spawn_transport(&hub, 2, cancel.child_token());

    a.ping(2, None).await?;
    let counters = a.counters().snapshot();
    assert!(counters.sent >= 1);
    assert!(counters.received >= 1);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_send_to_absent_node_times_out_after_retries() -> Result<()> {
    let hub = LoopbackHub::new();
    let cancel = CancellationToken::new();
    let a = spawn_transport(&hub, 1, cancel.child_token());

    let env = a.codec().create_ping(99)?;
    let started = std::time::Instant::now();
    let err = a
        .send(
            env,
            SendOptions {
                timeout: Duration::from_millis(100),
                retries: 2,
                expects_response: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
    // Three attempts of 100ms plus two backoffs.
    assert!(started.elapsed() >= Duration::from_millis(300));

    cancel.cancel();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_get_or_open_is_idempotent_and_marks_failure() -> Result<()> {
    let hub = LoopbackHub::new();
    let cancel = CancellationToken::new();
    let a = spawn_transport(&hub, 1, cancel.child_token());
    let _b = spawn_transport(&hub, 2, cancel.child_token());

    let conn = a.registry().get_or_open(&a, 2).await?;
    assert_eq!(conn.state(), ConnState::Open);
    let again = a.registry().get_or_open(&a, 2).await?;
    assert!(Arc::ptr_eq(&conn, &again));

    let missing = a.registry().get_or_open(&a, 42).await;
    assert!(missing.is_err());
    let failed = a.registry().connection(42).expect("conn exists");
    assert_eq!(failed.state(), ConnState::Failed);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_broadcast_reaches_all_peers() -> Result<()> {
    let hub = LoopbackHub::new();
    let cancel = CancellationToken::new();
    let a = spawn_transport(&hub, 1, cancel.child_token());
    let b = spawn_transport(&hub, 2, cancel.child_token());
    let c = spawn_transport(&hub, 3, cancel.child_token());

    let env = a.codec().encode(
        rednet_explorer::proto::envelope::MessageKind::PeerAnnounce,
        &rednet_explorer::proto::envelope::PeerAnnouncePayload {
            node_id: 1,
            class: "client".to_string(),
            version: "0.1.0".to_string(),
            capabilities: vec![],
            info: String::new(),
        },
        None,
    )?;
    a.broadcast(&env).await?;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(b.counters().snapshot().received, 1);
    assert_eq!(c.counters().snapshot().received, 1);

    cancel.cancel();
    Ok(())
}
