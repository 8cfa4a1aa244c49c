//! Nodes linked in memory gossip events and converge on one order.

use std::time::Duration;

use weave_federation::{link_in_memory, GossipConfig, Node, NodeConfig};

fn fast_config(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        gossip: GossipConfig {
            sync_interval_ms: 100,
            recompute_interval_ms: 50,
            event_interval_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn mesh(names: &[&str]) -> Vec<Node> {
    let nodes: Vec<Node> = names
        .iter()
        .map(|name| Node::new(fast_config(name)).unwrap())
        .collect();
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            link_in_memory(a, b).await.unwrap();
        }
    }
    nodes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mesh_reaches_consistent_order() {
    let nodes = mesh(&["alpha", "beta", "gamma"]).await;
    for (i, node) in nodes.iter().enumerate() {
        node.submit_transaction(format!("tx-{}", i).into_bytes()).await;
        node.start_timers().await;
    }

    let mut decided = false;
    for _ in 0..200 {
        let mut all = true;
        for node in &nodes {
            let graph = node.graph().read().await;
            all &= graph.last_decided_round().is_some_and(|r| r >= 2);
        }
        if all {
            decided = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for node in &nodes {
        node.shutdown().await;
    }
    assert!(decided, "nodes did not reach consensus in time");

    let orders: Vec<_> = {
        let mut orders = Vec::new();
        for node in &nodes {
            orders.push(node.graph().read().await.ordered_hashes());
        }
        orders
    };
    let longest = orders.iter().max_by_key(|o| o.len()).unwrap();
    for order in &orders {
        assert!(longest.starts_with(order));
    }

    let transactions = nodes[0].ordered_transactions(0).await;
    for i in 0..3 {
        assert!(transactions.contains(&format!("tx-{}", i).into_bytes()));
    }
}

#[tokio::test]
async fn registry_lists_linked_peers() {
    let nodes = mesh(&["alpha", "beta"]).await;
    let ids = nodes[0].node_ids().await;
    assert_eq!(ids.len(), 2);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(ids.contains(&nodes[1].node_id().to_string()));

    nodes[0].disconnect(nodes[1].node_id()).await;
    assert_eq!(nodes[0].node_ids().await, vec![nodes[0].node_id().to_string()]);
}

#[tokio::test]
async fn invalid_bytes_from_peer_are_ignored() {
    let nodes = mesh(&["alpha", "beta"]).await;
    let peer = nodes[1].node_id().to_string();

    nodes[0].handle_incoming(&peer, b"not json").await;
    let stats = nodes[0].stats().await;
    assert_eq!(stats.dag.total_events, 0);
    assert_eq!(stats.peers, 1);
}
