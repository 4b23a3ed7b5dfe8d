//! Deterministic CRDT merge: applies an incoming operation onto local
//! state so replicas converge regardless of delivery order.

use crate::document::{CrdtOperation, DistributedDocument, OperationType};
use crate::vector_clock::Ordering as ClockOrdering;

/// Applies an incoming operation to a (possibly absent) local document,
/// returning the new local state. `None` in, `None` out means "no
/// document existed and the operation carried no data" (malformed update
/// or delete-of-nothing); callers treat that as a no-op.
pub fn apply_operation(
    existing: Option<&DistributedDocument>,
    op: &CrdtOperation,
) -> Option<DistributedDocument> {
    match existing {
        None => match op.op_type {
            OperationType::Delete => None,
            OperationType::Insert | OperationType::Update => {
                op.data.clone().map(|mut doc| {
                    doc.vector = op.vector.clone();
                    doc.timestamp = op.timestamp;
                    doc.peer_id = op.peer_id.clone();
                    doc
                })
            }
        },
        Some(doc) => {
            let should_apply = matches!(
                doc.vector.compare(&op.vector),
                ClockOrdering::Before | ClockOrdering::Concurrent
            );
            if !should_apply {
                return Some(doc.clone());
            }

            let mut next = doc.clone();
            match op.op_type {
                OperationType::Delete => {
                    next.deleted = true;
                }
                OperationType::Insert | OperationType::Update => {
                    if let Some(incoming) = &op.data {
                        if let Some(incoming_payload) = &incoming.payload {
                            let existing_payload = next.payload.clone().unwrap_or_default();
                            // Same winner rule as merge_concurrent: later timestamp wins,
                            // ties broken by peer id, so both sides of a concurrent write
                            // land on the same field values regardless of apply order.
                            let next_is_winner = next.timestamp > op.timestamp
                                || (next.timestamp == op.timestamp && next.peer_id > op.peer_id);
                            let (winner, loser) = if next_is_winner {
                                (&existing_payload, incoming_payload)
                            } else {
                                (incoming_payload, &existing_payload)
                            };
                            let mut merged_payload = winner.clone();
                            for (k, v) in loser {
                                merged_payload.entry(k.clone()).or_insert_with(|| v.clone());
                            }
                            next.payload = Some(merged_payload);
                        }
                    }
                }
            }
            next.vector = next.vector.merge(&op.vector);
            next.timestamp = next.timestamp.max(op.timestamp);
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::EntryType;
    use crate::vector_clock::VectorClock;
    use std::collections::HashMap;

    fn doc(id: &str, peer: &str, n: u64, ts: i64, deleted: bool) -> DistributedDocument {
        let mut v = VectorClock::new();
        for _ in 0..n {
            v = v.increment(peer);
        }
        DistributedDocument {
            id: id.to_string(),
            entry_type: EntryType::Memory,
            payload: Some(HashMap::new()),
            vector: v,
            timestamp: ts,
            peer_id: peer.to_string(),
            stage: None,
            deleted,
        }
    }

    #[test]
    fn apply_operation_converges_regardless_of_delivery_order() {
        use std::collections::HashMap;

        let mut va = VectorClock::new();
        va = va.increment("A");
        let mut payload_a = HashMap::new();
        payload_a.insert("name".to_string(), serde_json::json!("Alice"));
        payload_a.insert("age".to_string(), serde_json::json!(30));
        let op_a = CrdtOperation {
            id: "opA".into(),
            op_type: OperationType::Insert,
            collection: "things".into(),
            document_id: "u1".into(),
            data: Some(DistributedDocument::new("u1", EntryType::Memory, payload_a, va.clone(), 1000, "A")),
            vector: va,
            timestamp: 1000,
            peer_id: "A".into(),
        };

        let mut vb = VectorClock::new();
        vb = vb.increment("B");
        let mut payload_b = HashMap::new();
        payload_b.insert("name".to_string(), serde_json::json!("Bob"));
        payload_b.insert("email".to_string(), serde_json::json!("b@x"));
        let op_b = CrdtOperation {
            id: "opB".into(),
            op_type: OperationType::Insert,
            collection: "things".into(),
            document_id: "u1".into(),
            data: Some(DistributedDocument::new("u1", EntryType::Memory, payload_b, vb.clone(), 1000, "B")),
            vector: vb,
            timestamp: 1000,
            peer_id: "B".into(),
        };

        // Peer A applies its own insert locally, then receives B's.
        let a_local = apply_operation(None, &op_a).unwrap();
        let a_final = apply_operation(Some(&a_local), &op_b).unwrap();

        // Peer B applies its own insert locally, then receives A's.
        let b_local = apply_operation(None, &op_b).unwrap();
        let b_final = apply_operation(Some(&b_local), &op_a).unwrap();

        assert_eq!(a_final.field("name"), b_final.field("name"));
        assert_eq!(a_final.field("age"), Some(&serde_json::json!(30)));
        assert_eq!(a_final.field("email"), Some(&serde_json::json!("b@x")));
        assert_eq!(a_final.field("age"), b_final.field("age"));
        assert_eq!(a_final.field("email"), b_final.field("email"));
        // Higher peer id wins the lexicographic tie-break on equal timestamps.
        assert_eq!(a_final.field("name"), Some(&serde_json::json!("Bob")));
    }

    #[test]
    fn apply_operation_materializes_new_document() {
        let mut v = VectorClock::new();
        v = v.increment("p1");
        let op = CrdtOperation {
            id: "op1".into(),
            op_type: OperationType::Insert,
            collection: "things".into(),
            document_id: "x".into(),
            data: Some(doc("x", "p1", 1, 100, false)),
            vector: v,
            timestamp: 100,
            peer_id: "p1".into(),
        };
        let result = apply_operation(None, &op).unwrap();
        assert_eq!(result.id, "x");
    }

    #[test]
    fn apply_operation_is_noop_when_local_dominates() {
        let local = doc("x", "p1", 2, 200, false);
        let op_vector = {
            let mut v = VectorClock::new();
            v.increment("p1")
        };
        let op = CrdtOperation {
            id: "op1".into(),
            op_type: OperationType::Update,
            collection: "things".into(),
            document_id: "x".into(),
            data: Some(local.clone()),
            vector: op_vector,
            timestamp: 1,
            peer_id: "p1".into(),
        };
        let result = apply_operation(Some(&local), &op).unwrap();
        assert_eq!(result.timestamp, 200);
    }
}
