use inari::{Client, LoopbackFabric, Node, TuningParams};

fn fixed_params(partitions: u16) -> TuningParams {
    TuningParams {
        fixed_partitions: partitions,
        ..Default::default()
    }
}

// Boundary: one partition routes every key to the sole node.
#[tokio::test]
async fn one_partition_owns_every_key() {
    inari_trace::test_run().ok();
    let fabric = LoopbackFabric::new();
    let node = Node::spawn(
        fabric.clone(),
        &["127.0.0.1".to_string()],
        0,
        fixed_params(1),
        None,
    )
    .await
    .expect("node up");
    let client = Client::connect(
        fabric,
        "127.0.0.1",
        &node.port().to_string(),
        fixed_params(1),
    )
    .await
    .expect("client connected");

    for i in 0..32 {
        assert!(client.put(format!("k{i}").as_bytes(), b"v").await.unwrap());
    }
    assert_eq!(node.used(), 32);
}

#[tokio::test]
async fn a_joiner_claims_the_vacant_partition() {
    inari_trace::test_run().ok();
    let fabric = LoopbackFabric::new();
    let host = vec!["127.0.0.1".to_string()];

    let first = Node::spawn(fabric.clone(), &host, 0, fixed_params(2), None)
        .await
        .expect("first up");
    let seed_addr = ("127.0.0.1".to_string(), first.port().to_string());

    let second = Node::spawn(fabric.clone(), &host, 0, fixed_params(2), Some(seed_addr))
        .await
        .expect("second joined");

    assert_eq!(first.id(), inari_types::KeyId(0x0000));
    assert_eq!(second.id(), inari_types::KeyId(0x8000));

    let client = Client::connect(
        fabric,
        "127.0.0.1",
        &first.port().to_string(),
        fixed_params(2),
    )
    .await
    .expect("client connected");

    let count = 40;
    for i in 0..count {
        assert!(
            client.put(format!("key-{i}").as_bytes(), b"v").await.unwrap(),
            "put key-{i}"
        );
    }
    for i in 0..count {
        assert!(client.contains(format!("key-{i}").as_bytes()).await.unwrap());
    }

    // both halves of the keyspace see traffic
    assert_eq!(first.used() + second.used(), count);
    assert!(first.used() > 0, "lower half empty");
    assert!(second.used() > 0, "upper half empty");
}
