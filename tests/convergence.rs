//! End-to-end scenarios exercising the `Database` facade: CRDT
//! convergence, unique-index enforcement, encrypted restart, and ANN
//! cluster recall.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use knirvbase::crypto::envelope::SignedEnvelope;
use knirvbase::document::{CrdtOperation, OperationType};
use knirvbase::index::{IndexMetadata, IndexType};
use knirvbase::prelude::*;
use knirvbase::query::Operator;
use knirvbase::vector_clock::VectorClock;
use serde_json::json;
use std::collections::HashMap;

fn payload(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Builds the insert operation a peer would have broadcast for `doc_id`,
/// without going through the network stack.
fn insert_op(
    peer: &str,
    doc_id: &str,
    entry_payload: HashMap<String, serde_json::Value>,
    timestamp: i64,
) -> CrdtOperation {
    let mut vector = VectorClock::new();
    vector = vector.increment(peer);
    CrdtOperation {
        id: format!("{peer}-{doc_id}-op"),
        op_type: OperationType::Insert,
        collection: "users".to_string(),
        document_id: doc_id.to_string(),
        data: Some(DistributedDocument::new(
            doc_id,
            EntryType::Memory,
            entry_payload,
            vector.clone(),
            timestamp,
            peer,
        )),
        vector,
        timestamp,
        peer_id: peer.to_string(),
    }
}

#[tokio::test]
async fn scenario_1_concurrent_writes_converge() {
    let a = Database::open(DbConfig::in_memory("A")).unwrap();
    let b = Database::open(DbConfig::in_memory("B")).unwrap();

    let op_a = insert_op("A", "u1", payload(&[("name", json!("Alice")), ("age", json!(30))]), 1_000);
    let op_b = insert_op("B", "u1", payload(&[("name", json!("Bob")), ("email", json!("b@x"))]), 1_000);

    // Each peer applies its own write locally, then receives the other's.
    a.collection("users").apply_remote_operation(&op_a);
    a.collection("users").apply_remote_operation(&op_b);

    b.collection("users").apply_remote_operation(&op_b);
    b.collection("users").apply_remote_operation(&op_a);

    let doc_a = a.collection("users").get("u1").unwrap().unwrap();
    let doc_b = b.collection("users").get("u1").unwrap().unwrap();

    assert_eq!(doc_a.field("name"), doc_b.field("name"));
    assert_eq!(doc_a.field("age"), Some(&json!(30)));
    assert_eq!(doc_a.field("email"), Some(&json!("b@x")));
    assert_eq!(doc_a.field("age"), doc_b.field("age"));
    assert_eq!(doc_a.field("email"), doc_b.field("email"));
}

#[tokio::test]
async fn scenario_2_late_arriving_stale_update_is_ignored() {
    let b = Database::open(DbConfig::in_memory("B")).unwrap();
    let things = b.collection("users");

    let mut va = VectorClock::new();
    va = va.increment("A");
    let insert = CrdtOperation {
        id: "A-insert".into(),
        op_type: OperationType::Insert,
        collection: "users".into(),
        document_id: "u1".into(),
        data: Some(DistributedDocument::new(
            "u1",
            EntryType::Memory,
            payload(&[("age", json!(30))]),
            va.clone(),
            100,
            "A",
        )),
        vector: va.clone(),
        timestamp: 100,
        peer_id: "A".into(),
    };

    let mut va2 = va.clone();
    va2 = va2.increment("A");
    let update = CrdtOperation {
        id: "A-update".into(),
        op_type: OperationType::Update,
        collection: "users".into(),
        document_id: "u1".into(),
        data: Some(DistributedDocument::new(
            "u1",
            EntryType::Memory,
            payload(&[("age", json!(31))]),
            va2.clone(),
            200,
            "A",
        )),
        vector: va2,
        timestamp: 200,
        peer_id: "A".into(),
    };

    // B receives the update before the insert it superseded.
    things.apply_remote_operation(&update);
    things.apply_remote_operation(&insert);

    let doc = things.get("u1").unwrap().unwrap();
    assert_eq!(doc.field("age"), Some(&json!(31)));
}

#[tokio::test]
async fn scenario_3_delete_dominates_concurrent_update() {
    let a = Database::open(DbConfig::in_memory("A")).unwrap();
    let b = Database::open(DbConfig::in_memory("B")).unwrap();

    a.collection("users")
        .insert("u1", EntryType::Memory, payload(&[("status", json!("off"))]), None)
        .await
        .unwrap();
    b.collection("users")
        .insert("u1", EntryType::Memory, payload(&[("status", json!("off"))]), None)
        .await
        .unwrap();

    let mut va = VectorClock::new();
    va = va.increment("A");
    va = va.increment("A");
    let delete = CrdtOperation {
        id: "A-delete".into(),
        op_type: OperationType::Delete,
        collection: "users".into(),
        document_id: "u1".into(),
        data: None,
        vector: va,
        timestamp: 300,
        peer_id: "A".into(),
    };

    let mut vb = VectorClock::new();
    vb = vb.increment("B");
    let update = CrdtOperation {
        id: "B-update".into(),
        op_type: OperationType::Update,
        collection: "users".into(),
        document_id: "u1".into(),
        data: Some(DistributedDocument::new(
            "u1",
            EntryType::Memory,
            payload(&[("status", json!("on"))]),
            vb.clone(),
            300,
            "B",
        )),
        vector: vb,
        timestamp: 300,
        peer_id: "B".into(),
    };

    a.collection("users").apply_remote_operation(&update);
    b.collection("users").apply_remote_operation(&delete);

    assert!(a.collection("users").get("u1").unwrap().is_none());
    assert!(b.collection("users").get("u1").unwrap().is_none());
}

#[tokio::test]
async fn scenario_4_unique_index_rejects_duplicate() {
    let db = Database::open(DbConfig::in_memory("A")).unwrap();
    let users = db.collection("users");
    users
        .create_index(IndexMetadata {
            name: "by_username".into(),
            collection: "users".into(),
            index_type: IndexType::BTree,
            key_fields: vec!["username".into()],
            unique: true,
            partial: None,
            dimension: None,
        })
        .unwrap();

    users
        .insert("u1", EntryType::Memory, payload(&[("username", json!("alice"))]), None)
        .await
        .unwrap();

    let err = users
        .insert("u2", EntryType::Memory, payload(&[("username", json!("alice"))]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Conflict { .. }));

    // The rejected document never reached storage.
    assert!(users.get("u2").unwrap().is_none());
}

#[tokio::test]
async fn scenario_5_encrypted_round_trip_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let credential = payload(&[
        ("hash", json!("sha256:deadbeef")),
        ("salt", json!("abcd1234")),
        ("username", json!("alice")),
    ]);

    {
        let db = Database::open(
            DbConfig::in_memory("A")
                .with_base_dir(dir.path())
                .with_master_passphrase("hunter2"),
        )
        .unwrap();
        db.collection("creds")
            .insert("c1", EntryType::Credential, credential.clone(), None)
            .await
            .unwrap();
    }

    // Restart: a fresh Database over the same directory and passphrase.
    {
        let db = Database::open(
            DbConfig::in_memory("A")
                .with_base_dir(dir.path())
                .with_master_passphrase("hunter2"),
        )
        .unwrap();
        let doc = db.collection("creds").get("c1").unwrap().unwrap();
        assert_eq!(doc.field("hash"), Some(&json!("sha256:deadbeef")));
        assert_eq!(doc.field("salt"), Some(&json!("abcd1234")));
    }

    // Corrupt the AEAD ciphertext inside the sealed envelope, leaving the
    // original signature in place: the message the signature covers no
    // longer matches, so verification must fail before decryption runs.
    let doc_path = dir.path().join("creds").join("c1.json");
    let mut on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&doc_path).unwrap()).unwrap();
    {
        let hash_b64 = on_disk["payload"]["hash"].as_str().unwrap().to_string();
        let envelope_bytes = BASE64.decode(&hash_b64).unwrap();
        let mut envelope: SignedEnvelope = serde_json::from_slice(&envelope_bytes).unwrap();
        let mut ciphertext = BASE64.decode(&envelope.payload.ciphertext).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        envelope.payload.ciphertext = BASE64.encode(&ciphertext);
        let corrupted = serde_json::to_vec(&envelope).unwrap();
        on_disk["payload"]["hash"] = json!(BASE64.encode(&corrupted));
    }
    std::fs::write(&doc_path, serde_json::to_vec_pretty(&on_disk).unwrap()).unwrap();

    {
        let db = Database::open(
            DbConfig::in_memory("A")
                .with_base_dir(dir.path())
                .with_master_passphrase("hunter2"),
        )
        .unwrap();
        let err = db.collection("creds").get("c1").unwrap_err();
        assert!(matches!(err, DbError::SignatureInvalid));
    }
}

#[tokio::test]
async fn scenario_6_ann_query_returns_cluster_members() {
    let db = Database::open(DbConfig::in_memory("A")).unwrap();
    let points = db.collection("points");
    points
        .create_index(IndexMetadata {
            name: "by_embedding".into(),
            collection: "points".into(),
            index_type: IndexType::Ann,
            key_fields: vec!["embedding".into()],
            unique: false,
            partial: None,
            dimension: Some(4),
        })
        .unwrap();

    for i in 0..20 {
        let v = 0.015 + (i as f64) * 1e-6;
        points
            .insert(
                format!("c1-{i}"),
                EntryType::Memory,
                payload(&[("embedding", json!([v, v, v, v]))]),
                None,
            )
            .await
            .unwrap();
    }
    for i in 0..20 {
        let v = 10.5 + (i as f64) * 1e-6;
        points
            .insert(
                format!("c2-{i}"),
                EntryType::Memory,
                payload(&[("embedding", json!([v, v, v, v]))]),
                None,
            )
            .await
            .unwrap();
    }

    let query = Query::new()
        .filter(Filter {
            field: "embedding".to_string(),
            operator: Operator::SimilarTo,
            value: json!([0.015, 0.015, 0.015, 0.015]),
        })
        .limit(5);

    let results = points.find(&query).unwrap();
    assert_eq!(results.len(), 5);
    let from_cluster_1 = results.iter().filter(|d| d.id.starts_with("c1-")).count();
    assert!(from_cluster_1 >= 3, "expected at least 3/5 results from cluster 1, got {from_cluster_1}");
}

#[tokio::test]
async fn index_plan_equivalence_across_scan_and_index_lookup() {
    let db = Database::open(DbConfig::in_memory("A")).unwrap();
    let people = db.collection("people");
    people
        .create_index(IndexMetadata {
            name: "by_age".into(),
            collection: "people".into(),
            index_type: IndexType::BTree,
            key_fields: vec!["age".into()],
            unique: false,
            partial: None,
            dimension: None,
        })
        .unwrap();

    for (id, age) in [("a", 20), ("b", 30), ("c", 30), ("d", 40)] {
        people
            .insert(id, EntryType::Memory, payload(&[("age", json!(age))]), None)
            .await
            .unwrap();
    }

    let indexed = Query::new().filter(Filter::eq("age", json!(30)));
    let mut via_index: Vec<String> = people.find(&indexed).unwrap().into_iter().map(|d| d.id).collect();
    via_index.sort();

    // Drop the index and re-run the identical query: same result set via
    // a full scan.
    let mut via_scan: Vec<String> = people
        .find(&Query::new())
        .unwrap()
        .into_iter()
        .filter(|d| d.field("age") == Some(&json!(30)))
        .map(|d| d.id)
        .collect();
    via_scan.sort();

    assert_eq!(via_index, via_scan);
}
