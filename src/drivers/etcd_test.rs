use std::time::Duration;

use super::etcd::*;
use crate::TxnOp;

#[test]
fn ttl_rounds_up_to_whole_seconds() {
    assert_eq!(ttl_seconds(Duration::from_millis(1)), 1);
    assert_eq!(ttl_seconds(Duration::from_secs(5)), 5);
    assert_eq!(ttl_seconds(Duration::from_millis(5_001)), 6);
    assert_eq!(ttl_seconds(Duration::ZERO), 1);
}

#[test]
fn endpoints_get_a_scheme_matching_transport() {
    let endpoints = vec!["127.0.0.1:2379".to_string(), "http://10.0.0.1:2379".to_string()];

    assert_eq!(
        normalize_endpoints(&endpoints, false),
        vec!["http://127.0.0.1:2379", "http://10.0.0.1:2379"]
    );
    assert_eq!(
        normalize_endpoints(&endpoints, true),
        vec!["https://127.0.0.1:2379", "http://10.0.0.1:2379"]
    );
}

#[test]
fn every_txn_op_is_translated() {
    let ops = vec![
        TxnOp::Put {
            key: "/a".into(),
            value: b"1".to_vec(),
        },
        TxnOp::Delete { key: "/b".into() },
    ];
    assert_eq!(to_etcd_ops(&ops).len(), 2);
}
