use crate::*;

use meshnet::PacketError;

/// Three fully meshed backbone nodes, each with three leaves.
fn backbone_mesh() -> Result<(Mesh, Vec<Link>)> {
    let mut mesh = Mesh::new();
    let mut links = Vec::new();
    for b in 0..3 {
        mesh.add_node(&format!("backbone_{b}"))?;
    }
    for b in 0..3 {
        for other in (b + 1)..3 {
            links.push(mesh.link(&format!("backbone_{b}"), &format!("backbone_{other}"))?);
        }
        for leaf in 0..3 {
            let name = format!("leaf_{b}_{leaf}");
            mesh.add_node(&name)?;
            links.push(mesh.link(&format!("backbone_{b}"), &name)?);
        }
    }
    Ok((mesh, links))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_pairs_reach_each_others_ping_service() -> Result<()> {
    let (mesh, _links) = backbone_mesh()?;
    mesh.wait_converged(Duration::from_secs(10)).await?;

    let deadline = Instant::now() + Duration::from_secs(60);
    let names = mesh.names();
    for from in &names {
        for to in &names {
            if from == to {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let payload = format!("{from}->{to}");
            ping(mesh.node(from), to, payload.as_bytes(), remaining)
                .await
                .with_context(|| format!("{from} could not reach {to}"))?;
        }
    }

    let stats: Vec<_> = names.iter().map(|n| mesh.node(n).stats()).collect();
    assert_eq!(stats.iter().map(|s| s.hop_limit_exceeded).sum::<u64>(), 0);
    assert_eq!(stats.iter().map(|s| s.malformed).sum::<u64>(), 0);

    mesh.shutdown().await
}

#[tokio::test]
async fn test_payloads_survive_multi_hop_round_trip() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c", "d"])?;
    let _links = [
        mesh.link("a", "b")?,
        mesh.link("b", "c")?,
        mesh.link("c", "d")?,
    ];
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let conn = mesh.node("a").listen_packet("sizes")?;
    let echo = Addr::new("d", "ping");
    let mut buf = vec![0u8; meshnet_core::wire::MAX_PAYLOAD];

    for size in [0usize, 1, 1_000, meshnet_core::wire::MAX_PAYLOAD] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        assert_eq!(conn.write_to(&payload, &echo)?, size);

        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let (n, from) = conn.read_from(&mut buf).await?;
        assert_eq!(from, echo);
        assert_eq!(n, size);
        assert!(buf[..n] == payload[..], "payload of {size} bytes corrupted");
    }

    mesh.shutdown().await
}

#[tokio::test]
async fn test_services_on_one_node_are_independent() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b"])?;
    let _ab = mesh.link("a", "b")?;
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let sender = mesh.node("a").listen_packet("tx")?;
    let red = mesh.node("b").listen_packet("red")?;
    let blue = mesh.node("b").listen_packet("blue")?;

    sender.write_to(b"for red", &Addr::new("b", "red"))?;
    sender.write_to(b"for blue", &Addr::new("b", "blue"))?;

    let mut buf = [0u8; 32];
    for (conn, expected) in [(&red, &b"for red"[..]), (&blue, &b"for blue"[..])] {
        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let (n, from) = conn.read_from(&mut buf).await?;
        assert_eq!(&buf[..n], expected);
        assert_eq!(from, sender.local_addr());
    }

    mesh.shutdown().await
}

#[tokio::test]
async fn test_local_delivery_skips_the_mesh() -> Result<()> {
    let mesh = Mesh::with_nodes(&["solo"])?;
    let node = mesh.node("solo");
    let a = node.listen_packet("a")?;
    let b = node.listen_packet("b")?;

    a.write_to(b"next door", &node.new_addr("solo", "b"))?;
    b.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
    let mut buf = [0u8; 16];
    let (n, from) = b.read_from(&mut buf).await?;
    assert_eq!(&buf[..n], b"next door");
    assert_eq!(from.to_string(), "solo:a");
    assert_eq!(node.stats().forwarded, 0);

    mesh.shutdown().await
}

#[tokio::test]
async fn test_read_deadline_expires() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a"])?;
    let conn = mesh.node("a").listen_packet("idle")?;
    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));

    let mut buf = [0u8; 8];
    let started = Instant::now();
    let result = conn.read_from(&mut buf).await;
    assert!(matches!(result, Err(PacketError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(90));

    conn.set_read_deadline(None);
    conn.write_to(b"now", &conn.local_addr())?;
    let (n, _) = conn.read_from(&mut buf).await?;
    assert_eq!(&buf[..n], b"now");

    mesh.shutdown().await
}

#[tokio::test]
async fn test_unreachable_destination_is_dropped_quietly() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a"])?;
    let node = mesh.node("a");
    let conn = node.listen_packet("")?;

    assert_eq!(conn.write_to(b"void", &Addr::new("nobody", "x"))?, 4);
    assert_eq!(node.stats().unreachable, 1);

    mesh.shutdown().await
}
