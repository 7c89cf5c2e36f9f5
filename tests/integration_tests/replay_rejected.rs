// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use tokio::time::sleep;

use crate::integration_tests::common::{TempSite, TestNet, fast_config};
use rednet_explorer::{
    bus::Bus,
    proto::{
        codec::Codec,
        envelope::RequestPayload,
    },
};

/// An envelope captured off the wire and re-injected later is dropped by
/// the replay window; the request handler never runs twice.
#[tokio::test]
#[serial]
async fn test_reinjected_envelope_is_dropped() -> Result<()> {
    let net = TestNet::spawn(&[10, 20]);
    let site = TempSite::with_files(&[(
        "count.lua",
        r#"
            local n = tonumber(storage.get("hits") or "0") + 1
            storage.set("hits", tostring(n))
            write(n)
        "#,
    )])
    .await;
    net.node(0)
        .host_site("apps.comp10.rednet", site.site_root())
        .await?;

    // Build the request with the victim's own codec so the MAC is valid,
    // capture its bytes, and send it normally once.
    let victim_codec = Codec::new(20, &fast_config());
    let payload = RequestPayload {
        method: "GET".to_string(),
        url: "rdnt://apps.comp10.rednet/count".to_string(),
        ..RequestPayload::default()
    };
    let env = victim_codec.create_request(10, &payload)?;
    let captured = Codec::to_bytes(&env)?;

    // The attacker's endpoint stands in for the wire: the frame reaches
    // the server once legitimately, then again as a replay.
    let (attacker_bus, _attacker_rx) = net.hub.attach(666);
    attacker_bus.transmit(Some(10), captured.clone()).await?;
    sleep(Duration::from_millis(300)).await;

    attacker_bus.transmit(Some(10), captured).await?;
    sleep(Duration::from_millis(300)).await;

    let counters = net.node(0).transport.counters().snapshot();
    assert_eq!(counters.replay_drop, 1, "counters: {counters:?}");

    // The handler ran exactly once: a fresh request sees hits == 2, not 3.
    let response = net
        .node(1)
        .fetch("rdnt://apps.comp10.rednet/count")
        .await?;
    assert_eq!(response.body, "2");
    Ok(())
}

/// A tampered payload fails the MAC check and is counted, not processed.
#[tokio::test]
#[serial]
async fn test_tampered_envelope_is_dropped() -> Result<()> {
    let net = TestNet::spawn(&[10, 20]);

    let victim_codec = Codec::new(20, &fast_config());
    let mut env = victim_codec.create_request(
        10,
        &RequestPayload {
            method: "GET".to_string(),
            url: "rdnt://apps.comp10.rednet/".to_string(),
            ..RequestPayload::default()
        },
    )?;
    env.data["url"] = serde_json::json!("rdnt://apps.comp10.rednet/admin");

    let (attacker_bus, _rx) = net.hub.attach(666);
    attacker_bus.transmit(Some(10), Codec::to_bytes(&env)?).await?;
    sleep(Duration::from_millis(300)).await;

    let counters = net.node(0).transport.counters().snapshot();
    assert_eq!(counters.integrity_drop, 1, "counters: {counters:?}");
    Ok(())
}
