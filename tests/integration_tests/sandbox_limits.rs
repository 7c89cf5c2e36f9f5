// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

use crate::integration_tests::common::{TempSite, TestNet, fast_config};

fn spin_config() -> rednet_explorer::cfg::config::Config {
    let mut cfg = fast_config();
    // A tight operation budget turns the spin into a fast, deterministic
    // limit_exceeded rather than a wall-clock timeout.
    cfg.sandbox.op_budget = 50_000;
    cfg.sandbox.wall_clock = Duration::from_millis(2000);
    cfg.transport.send_timeout = Duration::from_millis(2000);
    cfg
}

/// A handler that never yields is cut off and reported as 503 with the
/// limit reason, without wedging the server for other requests.
#[tokio::test]
#[serial]
async fn test_spinning_handler_returns_503() -> Result<()> {
    let net = TestNet::spawn_with(&[77, 88], spin_config);
    let site = TempSite::with_files(&[
        ("spin.lua", "while 1 do end"),
        ("fast.lua", "print(\"quick\")"),
        ("index.rwml", "# Site"),
    ])
    .await;
    net.node(0)
        .host_site("apps.comp77.rednet", site.site_root())
        .await?;

    let err = net
        .node(1)
        .fetch("rdnt://apps.comp77.rednet/spin")
        .await
        .unwrap_err();
    match err {
        rednet_explorer::error::CoreError::Unreachable(message) => {
            assert!(message.contains("503"), "got: {message}");
            assert!(message.contains("limit_exceeded"), "got: {message}");
        },
        other => panic!("unexpected {other:?}"),
    }

    // The other handler is untouched by the spin.
    let response = net
        .node(1)
        .fetch("rdnt://apps.comp77.rednet/fast")
        .await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "quick\n");
    Ok(())
}

/// A spinning handler in flight must not delay an independent request
/// beyond its own timeout.
#[tokio::test]
#[serial]
async fn test_spin_does_not_stall_other_requests() -> Result<()> {
    let net = TestNet::spawn_with(&[77, 88], spin_config);
    let site = TempSite::with_files(&[
        ("spin.lua", "while 1 do end"),
        ("fast.lua", "print(\"quick\")"),
    ])
    .await;
    net.node(0)
        .host_site("apps.comp77.rednet", site.site_root())
        .await?;

    let spin = {
        let node = std::sync::Arc::clone(net.node(1));
        tokio::spawn(async move { node.fetch("rdnt://apps.comp77.rednet/spin").await })
    };

    let started = std::time::Instant::now();
    let response = net
        .node(1)
        .fetch("rdnt://apps.comp77.rednet/fast")
        .await?;
    assert_eq!(response.body, "quick\n");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "fast request was stalled for {:?}",
        started.elapsed()
    );

    let _ = spin.await.expect("join");
    Ok(())
}

/// Session cookies survive across requests to a dynamic handler.
#[tokio::test]
#[serial]
async fn test_session_counter_handler() -> Result<()> {
    let net = TestNet::spawn(&[77, 88]);
    let site = TempSite::with_files(&[(
        "count.lua",
        r#"
            local n = tonumber(session.get("n") or "0") + 1
            session.set("n", tostring(n))
            write(n)
        "#,
    )])
    .await;
    net.node(0)
        .host_site("apps.comp77.rednet", site.site_root())
        .await?;

    let first = net.node(1).fetch("rdnt://apps.comp77.rednet/count").await?;
    assert_eq!(first.body, "1");
    let cookie = first
        .cookies_set
        .get("rdnt_session")
        .expect("session cookie set on first visit")
        .clone();

    // Replay the cookie by hand, the way a browser client would.
    let parsed = rednet_explorer::url::RdntUrl::parse("rdnt://apps.comp77.rednet/count")?;
    let resolved = net.node(1).resolve(&parsed.host).await?;
    let mut cookies = std::collections::BTreeMap::new();
    cookies.insert("rdnt_session".to_string(), cookie);
    let payload = rednet_explorer::proto::envelope::RequestPayload {
        method: "GET".to_string(),
        url: parsed.to_string(),
        cookies,
        ..Default::default()
    };
    let env = net
        .node(1)
        .transport
        .codec()
        .create_request(resolved.record.node_id, &payload)?;
    let reply = net.node(1).transport.exchange(env, None).await?;
    let response: rednet_explorer::proto::envelope::ResponsePayload =
        reply.payload().expect("response payload");
    assert_eq!(response.body, "2");
    Ok(())
}
