//! End-to-end smoke tests over a spawned 3-node cluster.

mod common;

use common::*;
use nimbus_store::volo_gen::nimbus::rpc;

#[tokio::test]
async fn put_get_delete_happy_path() {
    let cluster = TestCluster::spawn(3, ClusterSpec::default()).await;
    let client = kv_client(cluster.addr(0));

    let put_resp = put(&client, "k", "v", 0, None).await;
    assert_eq!(put_resp.status, rpc::PutStatus::PUT_STATUS_SUCCESS);
    assert_eq!(clock_counter(put_resp.version.as_ref(), "n1"), 1);

    let get_resp = get(&client, "k", 0).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_SUCCESS);
    let value = get_resp.value.expect("value present");
    assert_eq!(value.value.as_ref(), b"v");
    assert!(!value.deleted);
    assert_eq!(clock_counter(value.version.as_ref(), "n1"), 1);

    // Any node can coordinate: the same read through another node agrees.
    let client2 = kv_client(cluster.addr(1));
    let get_resp2 = get(&client2, "k", 0).await;
    assert_eq!(get_resp2.status, rpc::GetStatus::GET_STATUS_SUCCESS);
    assert_eq!(get_resp2.value.expect("value present").value.as_ref(), b"v");

    let del_resp = delete(&client, "k", 0, value.version.clone()).await;
    assert_eq!(del_resp.status, rpc::DeleteStatus::DELETE_STATUS_SUCCESS);

    let get_resp = get(&client, "k", 0).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_NOT_FOUND);
}

#[tokio::test]
async fn empty_key_is_rejected() {
    let spec = ClusterSpec {
        r: 1,
        w: 1,
        ..ClusterSpec::default()
    };
    let cluster = TestCluster::spawn(1, spec).await;
    let client = kv_client(cluster.addr(0));

    let put_resp = put(&client, "", "v", 0, None).await;
    assert_eq!(put_resp.status, rpc::PutStatus::PUT_STATUS_ERROR);
    assert!(put_resp.error_message.contains("empty"));

    let get_resp = get(&client, "", 0).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_ERROR);

    let del_resp = delete(&client, "", 0, None).await;
    assert_eq!(del_resp.status, rpc::DeleteStatus::DELETE_STATUS_ERROR);
}

#[tokio::test]
async fn concurrent_writes_surface_as_siblings() {
    let cluster = TestCluster::spawn(3, ClusterSpec::default()).await;

    // Two coordinators racing in the same quorum window leave different
    // replicas holding different siblings; seed that state through the
    // replica surface with the clocks such a race produces.
    let internal1 = internal_client(cluster.addr(0));
    let internal2 = internal_client(cluster.addr(1));
    for (internal, value, coordinator) in [
        (&internal1, "v1", "n1"),
        (&internal2, "v2", "n2"),
    ] {
        let resp = internal
            .replica_put(rpc::ReplicaPutRequest {
                key: "c".to_string().into(),
                value: value.as_bytes().to_vec().into(),
                version: Some(wire_clock(&[(coordinator, 1)])),
                coordinator_id: coordinator.to_string().into(),
                request_id: format!("seed-{coordinator}").into(),
                deleted: false,
                is_repair: false,
            })
            .await
            .expect("replica put rpc")
            .into_inner();
        assert_eq!(resp.status, rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS);
    }

    // Reading all replicas surfaces both siblings.
    let client3 = kv_client(cluster.addr(2));
    let get_resp = get(&client3, "c", 3).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_SUCCESS);
    assert!(get_resp.value.is_none());
    assert_eq!(get_resp.conflicts.len(), 2);
    let mut siblings: Vec<Vec<u8>> = get_resp
        .conflicts
        .iter()
        .map(|c| c.value.to_vec())
        .collect();
    siblings.sort();
    assert_eq!(siblings, vec![b"v1".to_vec(), b"v2".to_vec()]);

    // The client resolves by writing with the union of the sibling clocks.
    let client1 = kv_client(cluster.addr(0));
    let union = wire_clock(&[("n1", 1), ("n2", 1)]);
    let put_resp = put(&client1, "c", "resolved", 0, Some(union)).await;
    assert_eq!(put_resp.status, rpc::PutStatus::PUT_STATUS_SUCCESS);
    assert_eq!(clock_counter(put_resp.version.as_ref(), "n1"), 2);
    assert_eq!(clock_counter(put_resp.version.as_ref(), "n2"), 1);

    let get_resp = get(&client3, "c", 3).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_SUCCESS);
    let value = get_resp.value.expect("resolved value");
    assert_eq!(value.value.as_ref(), b"resolved");
    assert!(get_resp.conflicts.is_empty());
}

#[tokio::test]
async fn oversized_quorum_is_rejected() {
    let cluster = TestCluster::spawn(3, ClusterSpec::default()).await;
    let client = kv_client(cluster.addr(0));

    let result = client
        .get(rpc::GetRequest {
            key: "k".to_string().into(),
            consistency_r: 5,
            client_id: "it".to_string().into(),
            request_id: "it-oversized".to_string().into(),
        })
        .await;
    match result {
        Ok(_) => panic!("r=5 on a 3-replica key must fail"),
        Err(err) => assert!(format!("{err}").contains("exceeds replica count")),
    }
}

#[tokio::test]
async fn replica_delete_applies_exact_tombstone() {
    let spec = ClusterSpec {
        r: 1,
        w: 1,
        ..ClusterSpec::default()
    };
    let cluster = TestCluster::spawn(1, spec).await;
    let client = kv_client(cluster.addr(0));
    let internal = internal_client(cluster.addr(0));

    let put_resp = put(&client, "d", "v", 0, None).await;
    assert_eq!(put_resp.status, rpc::PutStatus::PUT_STATUS_SUCCESS);

    let del_resp = internal
        .replica_delete(rpc::ReplicaDeleteRequest {
            key: "d".to_string().into(),
            version: Some(wire_clock(&[("n1", 2)])),
            coordinator_id: "it".to_string().into(),
            request_id: "it-replica-del".to_string().into(),
        })
        .await
        .expect("replica delete rpc")
        .into_inner();
    assert_eq!(del_resp.status, rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS);

    // The tombstone occupies the key at the replica...
    let replica_get = internal
        .replica_get(rpc::ReplicaGetRequest {
            key: "d".to_string().into(),
            coordinator_id: "it".to_string().into(),
            request_id: "it-replica-get".to_string().into(),
        })
        .await
        .expect("replica get rpc")
        .into_inner();
    assert_eq!(replica_get.status, rpc::ReplicaStatus::REPLICA_STATUS_SUCCESS);
    assert!(replica_get.value.expect("tombstone").deleted);

    // ...and the client surface reads it as absent.
    let get_resp = get(&client, "d", 0).await;
    assert_eq!(get_resp.status, rpc::GetStatus::GET_STATUS_NOT_FOUND);
}

#[tokio::test]
async fn replica_put_requires_version() {
    let spec = ClusterSpec {
        r: 1,
        w: 1,
        ..ClusterSpec::default()
    };
    let cluster = TestCluster::spawn(1, spec).await;
    let internal = internal_client(cluster.addr(0));

    let resp = internal
        .replica_put(rpc::ReplicaPutRequest {
            key: "k".to_string().into(),
            value: b"v".to_vec().into(),
            version: None,
            coordinator_id: "it".to_string().into(),
            request_id: "it-no-version".to_string().into(),
            deleted: false,
            is_repair: true,
        })
        .await
        .expect("replica put rpc")
        .into_inner();
    assert_eq!(resp.status, rpc::ReplicaStatus::REPLICA_STATUS_ERROR);
    assert!(resp.error_message.contains("version"));
}
