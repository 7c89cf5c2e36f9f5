// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use tokio::time::sleep;

use crate::integration_tests::common::{TempSite, TestNet};

/// First-come alias resolution: 1111 registers `news` before 2222 does.
/// A third party settles on 1111; 2222's own copy ends up shadowed after
/// its first refresh.
#[tokio::test]
#[serial]
async fn test_alias_first_come_wins() -> Result<()> {
    let net = TestNet::spawn(&[1111, 2222, 3333]);
    let site_a = TempSite::with_files(&[("index.rwml", "# News by 1111")]).await;
    let site_b = TempSite::with_files(&[("index.rwml", "# News by 2222")]).await;

    let first = net.node(0).host_site("news", site_a.site_root()).await?;
    // The conflict resolution key is registration time; make sure the
    // second registration is strictly later.
    sleep(Duration::from_millis(20)).await;
    let second = net.node(1).host_site("news", site_b.site_root()).await?;
    assert!(first.registered_at < second.registered_at);

    // Third party sees the earliest registration.
    let resolved = net.node(2).resolve("news").await?;
    assert_eq!(resolved.record.owner_node_id, 1111);

    // The latecomer's first own lookup still answers locally, but kicks
    // off the refresh that discovers the earlier registration.
    let own = net.node(1).resolve("news").await?;
    assert_eq!(own.record.owner_node_id, 2222);
    sleep(Duration::from_millis(600)).await;

    let local = net.node(1).dns_registry.list_local();
    let news = local
        .iter()
        .find(|lr| lr.record.name == "news")
        .expect("local record kept");
    assert!(news.shadowed, "latecomer alias should be shadowed");

    // After shadowing, the latecomer resolves to the winner too.
    let after = net.node(1).resolve("news").await?;
    assert_eq!(after.record.owner_node_id, 1111);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_shadowed_alias_stops_answering_queries() -> Result<()> {
    let net = TestNet::spawn(&[1111, 2222, 3333]);
    let site_a = TempSite::with_files(&[("index.rwml", "# A")]).await;
    let site_b = TempSite::with_files(&[("index.rwml", "# B")]).await;

    net.node(0).host_site("news", site_a.site_root()).await?;
    sleep(Duration::from_millis(20)).await;
    net.node(1).host_site("news", site_b.site_root()).await?;

    // Trigger the latecomer's refresh and let it settle.
    let _ = net.node(1).resolve("news").await?;
    sleep(Duration::from_millis(600)).await;

    // A fresh third-party query now collects an answer only from the
    // winner, so there is no conflict left to flag.
    net.node(2).dns_cache.clear();
    let resolved = net.node(2).resolve("news").await?;
    assert_eq!(resolved.record.owner_node_id, 1111);
    assert!(!resolved.conflict);
    Ok(())
}
