// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;

use crate::integration_tests::common::{TempSite, TestNet};

#[tokio::test]
#[serial]
async fn test_register_and_resolve_computer_name() -> Result<()> {
    let net = TestNet::spawn(&[1234, 5678]);
    let site = TempSite::with_files(&[("index.rwml", "# Shop\nwelcome")]).await;

    let record = net
        .node(0)
        .host_site("shop.comp1234.rednet", site.site_root())
        .await?;
    assert_eq!(record.node_id, 1234);

    // Lookup from the other node goes over the bus, gets verified, and
    // lands in the local cache.
    let resolved = net.node(1).resolve("shop.comp1234.rednet").await?;
    assert_eq!(resolved.record.node_id, 1234);
    assert!(resolved.verified);
    assert!(!resolved.stale);

    let cached = net
        .node(1)
        .dns_cache
        .get("shop.comp1234.rednet")
        .expect("cache entry after resolution");
    assert_eq!(cached.record.node_id, 1234);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_fetch_static_page_end_to_end() -> Result<()> {
    let net = TestNet::spawn(&[1234, 5678]);
    let site = TempSite::with_files(&[
        ("index.rwml", "# Shop\nwelcome"),
        ("about.rwml", "# About\nthe shop"),
    ])
    .await;
    net.node(0)
        .host_site("shop.comp1234.rednet", site.site_root())
        .await?;

    let response = net
        .node(1)
        .fetch("rdnt://shop.comp1234.rednet/about")
        .await?;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("the shop"));
    assert_eq!(
        response.headers.get("Content-Type").map(String::as_str),
        Some("text/rwml")
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_missing_page_is_404() -> Result<()> {
    let net = TestNet::spawn(&[1234, 5678]);
    let site = TempSite::with_files(&[("index.rwml", "# Shop")]).await;
    net.node(0)
        .host_site("shop.comp1234.rednet", site.site_root())
        .await?;

    let err = net
        .node(1)
        .fetch("rdnt://shop.comp1234.rednet/nope")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rednet_explorer::error::CoreError::NotFound(_)
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_unregistered_name_is_unreachable() -> Result<()> {
    let net = TestNet::spawn(&[1234, 5678]);

    let err = net
        .node(1)
        .resolve("ghost.comp1234.rednet")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rednet_explorer::error::CoreError::Unreachable(_)
    ));
    Ok(())
}
