use std::collections::HashMap;

use inari::{Client, LoopbackFabric, Node, OverlayKind, TuningParams};
use inari_overlay::{ChordResolver, NodePool};
use inari_types::KeyId;

fn chord_params() -> TuningParams {
    TuningParams {
        overlay: OverlayKind::Chord,
        ..Default::default()
    }
}

async fn settle(nodes: &[Node], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.stabilize().await.ok();
        }
        for node in nodes {
            node.fix_fingers().await.ok();
        }
    }
}

// Scenario: five nodes join one at a time through the same seed; after
// stabilization the ring is consistent and every node resolves the same
// successor for sampled keys.
#[tokio::test]
async fn five_nodes_converge_to_one_ring() {
    inari_trace::test_run().ok();
    let fabric = LoopbackFabric::new();
    let host = vec!["127.0.0.1".to_string()];

    let mut nodes = Vec::new();
    nodes.push(
        Node::spawn(fabric.clone(), &host, 0, chord_params(), None)
            .await
            .expect("seed up"),
    );
    let seed_addr = ("127.0.0.1".to_string(), nodes[0].port().to_string());

    for i in 1..5 {
        let node = Node::spawn(
            fabric.clone(),
            &host,
            0,
            chord_params(),
            Some(seed_addr.clone()),
        )
        .await
        .unwrap_or_else(|e| panic!("node {i} failed to join: {e}"));
        nodes.push(node);
        settle(&nodes, 4).await;
    }
    settle(&nodes, 4).await;

    let by_id: HashMap<KeyId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id(), i))
        .collect();
    assert_eq!(by_id.len(), 5, "node ids must be distinct");

    // successor.predecessor == self for every node
    for node in &nodes {
        let image = node.chord_image().expect("chord overlay");
        let succ = image.successor().node;
        let succ_index = by_id[&succ.id];
        let succ_image = nodes[succ_index].chord_image().expect("chord overlay");
        assert_eq!(
            succ_image.predecessor().node.id,
            node.id(),
            "successor of {} does not point back",
            node.id()
        );
    }

    // the successors trace the full ring
    let mut seen = Vec::new();
    let mut current = 0usize;
    for _ in 0..5 {
        seen.push(current);
        let succ = nodes[current].chord_image().unwrap().successor().node.id;
        current = by_id[&succ];
    }
    assert_eq!(current, 0, "successor chain must close");
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4], "chain must visit every node");

    // successor(k) agrees no matter which node resolves it
    let resolver = ChordResolver::new(NodePool::new(fabric.clone()));
    for k in [0u16, 0x1357, 0x8000, 0xabcd, 0xffff] {
        let mut owners = Vec::new();
        for node in &nodes {
            let from = resolver
                .pool()
                .node("127.0.0.1", &node.port().to_string())
                .await
                .expect("reachable");
            let entry = resolver
                .successor_via(&from, KeyId(k))
                .await
                .expect("resolvable");
            owners.push(entry.node.id);
        }
        owners.dedup();
        assert_eq!(owners.len(), 1, "key {k:#06x} resolved to {owners:?}");
    }
}

#[tokio::test]
async fn data_spreads_across_the_ring() {
    inari_trace::test_run().ok();
    let fabric = LoopbackFabric::new();
    let host = vec!["127.0.0.1".to_string()];

    let seed = Node::spawn(fabric.clone(), &host, 0, chord_params(), None)
        .await
        .expect("seed up");
    let seed_addr = ("127.0.0.1".to_string(), seed.port().to_string());
    let second = Node::spawn(
        fabric.clone(),
        &host,
        0,
        chord_params(),
        Some(seed_addr.clone()),
    )
    .await
    .expect("second up");
    let third = Node::spawn(fabric.clone(), &host, 0, chord_params(), Some(seed_addr))
        .await
        .expect("third up");

    let nodes = [seed, second, third];
    settle(&nodes, 6).await;

    let client = Client::connect(
        fabric,
        "127.0.0.1",
        &nodes[0].port().to_string(),
        chord_params(),
    )
    .await
    .expect("client connected");

    let count = 120;
    for i in 0..count {
        assert!(
            client
                .put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
                .await
                .unwrap(),
            "put key-{i}"
        );
    }
    for i in 0..count {
        assert_eq!(
            client.get(format!("key-{i}").as_bytes()).await.unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "key-{i}"
        );
    }

    let stored: usize = nodes.iter().map(|n| n.used()).sum();
    assert_eq!(stored, count);
    // with 3 nodes on a hashed ring the load should not all land on one
    assert!(
        nodes.iter().filter(|n| n.used() > 0).count() >= 2,
        "distribution: {:?}",
        nodes.iter().map(|n| n.used()).collect::<Vec<_>>()
    );
}
