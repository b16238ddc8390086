use inari::{Client, LoopbackFabric, Node, TuningParams};
use pretty_assertions::assert_eq;

// Scenario: enough inserts to force at least one resize; every record
// survives and stays retrievable through the one-sided read path, which
// must notice the republished node-info cell.
#[tokio::test]
async fn resize_preserves_contents() {
    inari_trace::test_run().ok();
    let fabric = LoopbackFabric::new();
    let params = TuningParams {
        initial_table_size: 32,
        ..Default::default()
    };
    let node = Node::spawn(
        fabric.clone(),
        &["127.0.0.1".to_string()],
        0,
        params.clone(),
        None,
    )
    .await
    .expect("node up");
    let client = Client::connect(fabric, "127.0.0.1", &node.port().to_string(), params)
        .await
        .expect("client connected");

    let count = 100usize;
    for i in 0..count {
        assert!(
            client
                .put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
                .await
                .unwrap(),
            "put key-{i}"
        );
    }

    assert!(
        node.table_entries() > 32,
        "a table of 32 slots cannot hold {count} records without growing"
    );
    assert_eq!(node.used(), count);
    node.check_consistency();

    for i in 0..count {
        assert_eq!(
            client.get(format!("key-{i}").as_bytes()).await.unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "key-{i} lost after resize"
        );
    }
}
