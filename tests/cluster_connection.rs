//! Replicated connections across leader changes on a three-node cluster.

use std::time::Duration;

use raftlite::prelude::*;

const WAIT: Duration = Duration::from_secs(10);

const CREATE: &str = "CREATE TABLE foo (id integer not null primary key, name text)";

fn results_json(response: &ExecuteResponse) -> String {
    serde_json::to_string(&response.json().results).unwrap()
}

async fn three_node_cluster(dir: &std::path::Path) -> LocalCluster {
    let mut cluster = LocalCluster::new(dir.to_path_buf());
    cluster.provision_leader("node1", WAIT).await.unwrap();

    cluster.provision("node2").await.unwrap();
    cluster.join("node2", "node1").await.unwrap();
    cluster.provision("node3").await.unwrap();
    cluster.join("node3", "node1").await.unwrap();

    let leader = cluster.wait_for_leader(WAIT).await.unwrap();
    assert_eq!(leader.id(), "node1");
    assert_eq!(leader.status().voters.len(), 3);
    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_survives_leader_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = three_node_cluster(dir.path()).await;

    let leader = cluster.leader().unwrap();
    let mut conn = Connection::open(leader.router(), "system-test").await.unwrap();

    let created = conn.execute(&[CREATE]).await.unwrap();
    assert_eq!(results_json(&created), r#"[{}]"#);
    assert!(created.raft_idx > conn.id());

    let inserted = conn
        .execute(&["INSERT INTO foo(name) VALUES('fiona')"])
        .await
        .unwrap();
    assert_eq!(
        results_json(&inserted),
        r#"[{"last_insert_id":1,"rows_affected":1}]"#
    );
    assert!(inserted.raft_idx > created.raft_idx);

    let rows = conn.query(&["SELECT * FROM foo"]).await.unwrap();
    assert_eq!(
        rows.to_json_string(),
        r#"{"results":[{"columns":["id","name"],"types":["integer","text"],"values":[[1,"fiona"]]}]}"#
    );

    // Kill the leader and keep using the connection through a survivor.
    cluster.deprovision("node1").unwrap();
    let new_leader = cluster.wait_for_new_leader("node1", WAIT).await.unwrap();
    let new_leader_id = new_leader.id().to_string();
    let survivor = if new_leader_id == "node2" { "node3" } else { "node2" };
    conn.reattach(cluster.node(survivor).unwrap().router());

    let created_again = conn.execute(&[CREATE]).await.unwrap();
    assert_eq!(
        results_json(&created_again),
        r#"[{"error":"table foo already exists"}]"#
    );
    assert!(created_again.raft_idx > inserted.raft_idx);

    let inserted = conn
        .execute(&["INSERT INTO foo(name) VALUES('sinead')"])
        .await
        .unwrap();
    assert_eq!(
        results_json(&inserted),
        r#"[{"last_insert_id":2,"rows_affected":1}]"#
    );

    let rows = conn.query(&["SELECT * FROM foo"]).await.unwrap();
    assert_eq!(
        rows.to_json_string(),
        r#"{"results":[{"columns":["id","name"],"types":["integer","text"],"values":[[1,"fiona"],[2,"sinead"]]}]}"#
    );

    // Move the connection onto the new leader itself.
    conn.reattach(cluster.node(&new_leader_id).unwrap().router());

    let created_again = conn.execute(&[CREATE]).await.unwrap();
    assert_eq!(
        results_json(&created_again),
        r#"[{"error":"table foo already exists"}]"#
    );

    let inserted = conn
        .execute(&["INSERT INTO foo(name) VALUES('declan')"])
        .await
        .unwrap();
    assert_eq!(
        results_json(&inserted),
        r#"[{"last_insert_id":3,"rows_affected":1}]"#
    );

    let rows = conn.query(&["SELECT COUNT(id) FROM foo"]).await.unwrap();
    assert_eq!(
        rows.to_json_string(),
        r#"{"results":[{"columns":["COUNT(id)"],"types":[""],"values":[[3]]}]}"#
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_forwards_to_leader() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = three_node_cluster(dir.path()).await;

    let follower = cluster.node("node2").unwrap();
    follower.raft().await_leader(WAIT).await.unwrap();
    assert!(!follower.raft().is_leader());

    // Connections and writes made through a follower land in the leader's log.
    let conn = Connection::open(follower.router(), "via-follower").await.unwrap();
    let written = conn
        .execute_transaction(&[CREATE, "INSERT INTO foo(name) VALUES('fiona')"])
        .await
        .unwrap();
    assert_eq!(
        results_json(&written),
        r#"[{},{"last_insert_id":1,"rows_affected":1}]"#
    );

    // A strong read goes through the log; a none read answers from local state
    // once this node has applied the write.
    let strong = conn
        .query_with(&["SELECT name FROM foo"], ReadConsistency::Strong)
        .await
        .unwrap();
    assert_eq!(
        strong.to_json_string(),
        r#"{"results":[{"columns":["name"],"types":["text"],"values":[["fiona"]]}]}"#
    );

    follower
        .raft()
        .wait_applied(written.raft_idx, WAIT)
        .await
        .unwrap();
    let local = conn
        .query_with(&["SELECT name FROM foo"], ReadConsistency::None)
        .await
        .unwrap();
    assert_eq!(local, strong);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_connection_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = LocalCluster::new(dir.path().to_path_buf());
    let leader = cluster.provision_leader("node1", WAIT).await.unwrap();

    let err = leader
        .router()
        .execute(9999, vec![CREATE.to_string()], false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownConnection(9999)), "{err}");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_node_converges_on_the_same_rows() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = three_node_cluster(dir.path()).await;

    let mut conn = Connection::open(cluster.leader().unwrap().router(), "converge")
        .await
        .unwrap();
    conn.execute(&[CREATE]).await.unwrap();
    conn.execute(&[
        "INSERT INTO foo(name) VALUES('fiona')",
        "INSERT INTO foo(name) VALUES('sinead')",
    ])
    .await
    .unwrap();
    conn.execute_transaction(&[
        "UPDATE foo SET name = 'declan' WHERE id = 2",
        "INSERT INTO foo(name) VALUES('aoife')",
    ])
    .await
    .unwrap();
    let last = conn
        .execute(&["DELETE FROM foo WHERE id = 1"])
        .await
        .unwrap();

    let expected = r#"{"results":[{"columns":["id","name"],"types":["integer","text"],"values":[[2,"declan"],[3,"aoife"]]}]}"#;
    for id in cluster.ids() {
        let node = cluster.node(&id).unwrap();
        node.raft().wait_applied(last.raft_idx, WAIT).await.unwrap();
        conn.reattach(node.router());

        let rows = conn
            .query_with(&["SELECT * FROM foo ORDER BY id"], ReadConsistency::None)
            .await
            .unwrap();
        assert_eq!(rows.to_json_string(), expected, "node {id}");
    }

    // Transaction control on the read path is refused rather than left open
    // on one node's database.
    conn.reattach(cluster.node("node2").unwrap().router());
    let refused = conn
        .query_with(&["BEGIN", "ROLLBACK"], ReadConsistency::Weak)
        .await
        .unwrap();
    assert_eq!(
        refused.to_json_string(),
        r#"{"results":[{"error":"attempt to change database via query operation"},{"error":"attempt to change database via query operation"}]}"#
    );

    let after = conn
        .execute(&["INSERT INTO foo(name) VALUES('niamh')"])
        .await
        .unwrap();
    for id in cluster.ids() {
        let node = cluster.node(&id).unwrap();
        node.raft().wait_applied(after.raft_idx, WAIT).await.unwrap();
        conn.reattach(node.router());
        let count = conn
            .query_with(&["SELECT COUNT(*) FROM foo"], ReadConsistency::None)
            .await
            .unwrap();
        assert_eq!(
            count.to_json_string(),
            r#"{"results":[{"columns":["COUNT(*)"],"types":[""],"values":[[3]]}]}"#,
            "node {id}"
        );
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_through_follower() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = three_node_cluster(dir.path()).await;

    let follower = cluster.node("node2").unwrap();
    let index = follower.router().remove("node3").await.unwrap();

    let leader = cluster.leader().unwrap();
    let mut voters: Vec<String> = leader.status().voters.into_iter().map(|v| v.id).collect();
    voters.sort();
    assert_eq!(voters, vec!["node1".to_string(), "node2".to_string()]);

    follower.raft().wait_applied(index, WAIT).await.unwrap();
    assert_eq!(follower.status().voters.len(), 2);

    // Removing an unknown node is rejected without a log entry.
    let err = follower.router().remove("node3").await.unwrap_err();
    assert!(matches!(err, Error::NodeNotFound(_)), "{err}");

    // Two voters still form a quorum once the removed node is gone.
    cluster.deprovision("node3").unwrap();
    let conn = Connection::open(cluster.node("node2").unwrap().router(), "after-remove")
        .await
        .unwrap();
    let written = conn
        .execute_transaction(&[CREATE, "INSERT INTO foo(name) VALUES('fiona')"])
        .await
        .unwrap();
    assert_eq!(
        results_json(&written),
        r#"[{},{"last_insert_id":1,"rows_affected":1}]"#
    );
    assert_eq!(cluster.leader().unwrap().id(), "node1");

    cluster.shutdown().await;
}
