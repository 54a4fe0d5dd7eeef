use crate::*;

#[tokio::test]
async fn test_chain_converges_within_five_seconds() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c", "d"])?;
    let _ab = mesh.link("a", "b")?;
    let _bc = mesh.link("b", "c")?;
    let _cd = mesh.link("c", "d")?;

    mesh.wait_converged(Duration::from_secs(5)).await?;

    let table = mesh.node("a").routing_table();
    assert_eq!(table["a"], "a");
    assert_eq!(table["b"], "b");
    assert_eq!(table["c"], "b");
    assert_eq!(table["d"], "b");

    let table = mesh.node("d").routing_table();
    assert_eq!(table["a"], "c");

    mesh.shutdown().await
}

#[tokio::test]
async fn test_every_next_hop_is_a_live_neighbor() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c", "d", "e"])?;
    let _links = [
        mesh.link("a", "b")?,
        mesh.link("b", "c")?,
        mesh.link("c", "d")?,
        mesh.link("d", "e")?,
        mesh.link("e", "a")?,
    ];
    mesh.wait_converged(Duration::from_secs(5)).await?;

    for name in mesh.names() {
        let node = mesh.node(&name);
        for (destination, next_hop) in node.routing_table().iter() {
            if *destination == name {
                assert_eq!(*next_hop, name);
                continue;
            }
            assert!(
                node.connection_info(next_hop).is_some(),
                "{name} routes {destination} via {next_hop}, which is not a neighbor"
            );
        }
    }

    mesh.shutdown().await
}

#[tokio::test]
async fn test_cheapest_path_is_preferred() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c", "d"])?;
    let _links = [
        mesh.link("a", "b")?,
        mesh.link("b", "d")?,
        mesh.link("a", "c")?,
        mesh.link_with_cost("c", "d", 5.0)?,
    ];
    mesh.wait_converged(Duration::from_secs(5)).await?;

    assert_eq!(mesh.node("a").routing_table()["d"], "b");
    assert_eq!(mesh.node("d").routing_table()["a"], "b");
    // Direct neighbors route to themselves even when a detour is cheaper.
    assert_eq!(mesh.node("c").routing_table()["d"], "d");
    assert_eq!(mesh.node("c").connection_info("d").map(|c| c.cost), Some(5.0));

    mesh.shutdown().await
}

#[tokio::test]
async fn test_route_withdrawn_when_link_fails() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c"])?;
    let _ab = mesh.link("a", "b")?;
    let bc = mesh.link("b", "c")?;
    mesh.wait_converged(Duration::from_secs(5)).await?;
    assert_eq!(mesh.node("a").routing_table()["c"], "b");

    bc.cut();

    wait_until(test_settings().route_update_interval(), || {
        !mesh.node("a").routing_table().contains_key("c")
            && !mesh.node("b").routing_table().contains_key("c")
            && !mesh.node("c").routing_table().contains_key("a")
    })
    .await
    .context("route to c should be withdrawn")?;

    assert!(mesh.node("b").connection_info("c").is_none());
    assert!(mesh.node("a").routing_table().contains_key("b"));

    mesh.shutdown().await
}

#[tokio::test]
async fn test_alternate_path_takes_over() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c", "d"])?;
    let ab = mesh.link("a", "b")?;
    let _bd = mesh.link("b", "d")?;
    let _ac = mesh.link_with_cost("a", "c", 2.0)?;
    let _cd = mesh.link_with_cost("c", "d", 2.0)?;
    mesh.wait_converged(Duration::from_secs(5)).await?;
    assert_eq!(mesh.node("a").routing_table()["d"], "b");

    ab.cut();

    wait_until(Duration::from_secs(5), || {
        mesh.node("a").routing_table().get("d").map(String::as_str) == Some("c")
    })
    .await
    .context("a should reroute to d via c")?;
    ping(mesh.node("a"), "d", b"detour", Duration::from_secs(5)).await?;

    mesh.shutdown().await
}

#[tokio::test]
async fn test_feed_reports_new_destinations() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b"])?;
    let mut feed = mesh.node("a").subscribe_routing_updates();

    let first = feed.next().await.context("feed closed early")?;
    assert_eq!(first.len(), 1);

    let _ab = mesh.link("a", "b")?;
    let learned = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(table) = feed.next().await {
            if table.contains_key("b") {
                return Some(table);
            }
        }
        None
    })
    .await?
    .context("feed closed before b appeared")?;
    assert_eq!(learned["b"], "b");

    mesh.shutdown().await?;
    assert!(feed.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_feeds_are_independent() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b"])?;
    let mut fast = mesh.node("a").subscribe_routing_updates();
    let mut slow = mesh.node("a").subscribe_routing_updates();

    assert_eq!(fast.next().await.context("fast feed closed")?.len(), 1);
    assert_eq!(slow.next().await.context("slow feed closed")?.len(), 1);
    let _ab = mesh.link("a", "b")?;

    let on_fast = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(table) = fast.next().await {
            if table.contains_key("b") {
                return Some(table);
            }
        }
        None
    })
    .await?
    .context("fast feed closed before b appeared")?;

    // Draining the first feed did not consume the change for the second.
    let on_slow = tokio::time::timeout(Duration::from_secs(1), slow.next())
        .await?
        .context("slow feed closed")?;
    assert_eq!(on_slow, on_fast);

    // A third subscriber starts from the current table, not from the past.
    let mut late = mesh.node("a").subscribe_routing_updates();
    assert_eq!(late.next().await.context("late feed closed")?, on_fast);

    mesh.shutdown().await?;
    assert!(fast.next().await.is_none());
    assert!(slow.next().await.is_none());
    Ok(())
}
