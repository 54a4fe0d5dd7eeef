use crate::*;

use meshnet::{ConnState, PacketError};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_duplicate_link_is_rejected() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b"])?;
    let _first = mesh.link("a", "b")?;
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let _second = mesh.link("a", "b")?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for (node, peer) in [("a", "b"), ("b", "a")] {
        let status = mesh.node(node).status();
        assert_eq!(status.connections.len(), 1, "{node} should keep one link");
        assert_eq!(status.connections[0].peer, peer);
        assert_eq!(status.connections[0].state, ConnState::Open);
    }
    ping(mesh.node("a"), "b", b"still here", Duration::from_secs(5)).await?;

    mesh.shutdown().await
}

/// Two links offered at the same moment must settle on one surviving link
/// that both sides agree on.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_links_keep_one() -> Result<()> {
    for round in 0..10 {
        let mesh = Mesh::with_nodes(&["a", "b"])?;
        let (first_a, first_b, _first) = severable_pipe();
        let (second_a, second_b, _second) = severable_pipe();
        attach(mesh.node("a"), first_a, 1.0)?;
        attach(mesh.node("b"), second_b, 1.0)?;
        attach(mesh.node("a"), second_a, 1.0)?;
        attach(mesh.node("b"), first_b, 1.0)?;

        mesh.wait_converged(Duration::from_secs(5))
            .await
            .with_context(|| format!("round {round}"))?;
        ping(mesh.node("a"), "b", b"one link", Duration::from_secs(5))
            .await
            .with_context(|| format!("round {round}"))?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        for node in ["a", "b"] {
            let status = mesh.node(node).status();
            assert_eq!(status.connections.len(), 1, "round {round}: {node} link count");
            assert_eq!(status.connections[0].state, ConnState::Open);
        }
        mesh.shutdown().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_self_link_is_rejected() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a"])?;
    let _loop = mesh.link("a", "a")?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let node = mesh.node("a");
    assert!(node.status().connections.is_empty());
    assert_eq!(node.routing_table().len(), 1);

    mesh.shutdown().await
}

#[tokio::test]
async fn test_shutdown_stops_everything() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b", "c"])?;
    let _links = [mesh.link("a", "b")?, mesh.link("b", "c")?];
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let reader = mesh.node("a").listen_packet("waiting")?;
    let mut feed = mesh.node("a").subscribe_routing_updates();
    feed.next().await.context("feed should be primed")?;

    let blocked = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read_from(&mut buf).await.map(|(n, _)| n)
    });

    mesh.shutdown().await?;

    let result = tokio::time::timeout(Duration::from_secs(1), blocked).await??;
    assert!(matches!(result, Err(PacketError::Closed)));
    assert!(feed.next().await.is_none());
    assert!(matches!(
        mesh.node("a").listen_packet("late"),
        Err(PacketError::Closed)
    ));
    assert!(mesh
        .node("b")
        .add_backend(ExternalBackend::new(), 1.0, None)
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_status_serializes() -> Result<()> {
    let mesh = Mesh::with_nodes(&["a", "b"])?;
    let _ab = mesh.link("a", "b")?;
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let json = serde_json::to_value(mesh.node("a").status())?;
    assert_eq!(json["id"], "a");
    assert_eq!(json["connections"][0]["peer"], "b");
    assert_eq!(json["routing_table"]["b"], "b");
    assert!(json["known_nodes"]["b"].get("a").is_some());
    assert!(json["stats"]["delivered"].is_u64());

    mesh.shutdown().await
}

/// Two nodes over a real loopback socket using the length-prefixed stream
/// framing.
#[tokio::test]
async fn test_tcp_stream_link() -> Result<()> {
    let mesh = Mesh::with_nodes(&["east", "west"])?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (accepted, _) = accepted?;

    attach(mesh.node("east"), MessageConn::from_stream(dialed?), 1.0)?;
    attach(mesh.node("west"), MessageConn::from_stream(accepted), 1.0)?;
    mesh.wait_converged(Duration::from_secs(5)).await?;

    let rtt = ping(mesh.node("east"), "west", &[7u8; 4096], Duration::from_secs(5)).await?;
    assert!(rtt < Duration::from_secs(5));

    mesh.shutdown().await
}
