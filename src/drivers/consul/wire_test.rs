use std::time::Duration;

use super::*;
use crate::EventKind;

fn snapshot(entries: &[(&str, &str, u64)]) -> Snapshot {
    entries
        .iter()
        .map(|(k, v, i)| (k.to_string(), (v.as_bytes().to_vec(), *i)))
        .collect()
}

#[test]
fn leading_slash_is_stripped_and_restored() {
    assert_eq!(to_wire("/a/b"), "a/b");
    assert_eq!(to_wire("a/b"), "a/b");
    assert_eq!(from_wire("/a/", "a/b"), "/a/b");
    assert_eq!(from_wire("a/", "a/b"), "a/b");
}

#[test]
fn kv_entries_decode_base64_and_null_values() {
    let entries: Vec<KvEntry> = serde_json::from_str(
        r#"[
            {"Key": "a/b", "Value": "aGVsbG8=", "ModifyIndex": 42, "CreateIndex": 40, "Flags": 0},
            {"Key": "a/c", "Value": null, "ModifyIndex": 43}
        ]"#,
    )
    .unwrap();

    assert_eq!(entries[0].decode_value().unwrap(), b"hello");
    assert_eq!(entries[0].modify_index, 42);
    assert!(entries[1].decode_value().unwrap().is_empty());
}

#[test]
fn txn_body_uses_consul_verbs() {
    let body = txn_body(&[
        crate::TxnOp::Put {
            key: "/a".into(),
            value: b"hi".to_vec(),
        },
        crate::TxnOp::Delete { key: "/b".into() },
    ]);
    let json = serde_json::to_value(&body).unwrap();

    assert_eq!(
        json,
        serde_json::json!([
            {"KV": {"Verb": "set", "Key": "a", "Value": "aGk="}},
            {"KV": {"Verb": "delete", "Key": "b"}}
        ])
    );
}

#[test]
fn session_ttl_is_clamped_to_consul_bounds() {
    assert_eq!(session_ttl(Duration::from_secs(1)), "10s");
    assert_eq!(session_ttl(Duration::from_secs(90)), "90s");
    assert_eq!(session_ttl(Duration::from_secs(200_000)), "86400s");
}

#[test]
fn snapshot_diff_synthesises_puts_and_deletes() {
    let old = snapshot(&[("/k/a", "1", 5), ("/k/b", "2", 6), ("/k/c", "3", 7)]);
    let new = snapshot(&[("/k/a", "1", 5), ("/k/b", "22", 9), ("/k/d", "4", 10)]);

    let events = diff_snapshots(&old, &new, 10);

    assert_eq!(events.len(), 3);
    let changed = events.iter().find(|e| e.key == "/k/b").unwrap();
    assert_eq!(changed.kind, EventKind::Put);
    assert_eq!(changed.prev_value.as_deref(), Some(&b"2"[..]));
    assert_eq!(changed.revision, 9);

    let created = events.iter().find(|e| e.key == "/k/d").unwrap();
    assert_eq!(created.prev_value, None);

    let removed = events.iter().find(|e| e.key == "/k/c").unwrap();
    assert_eq!(removed.kind, EventKind::Delete);
    assert_eq!(removed.revision, 10);
}

#[test]
fn blocking_index_resets_when_it_goes_backwards() {
    assert_eq!(next_index(0, 12), 12);
    assert_eq!(next_index(12, 15), 15);
    assert_eq!(next_index(15, 3), 0);
}

#[test]
fn kv_url_escapes_reserved_characters_per_segment() {
    let base = Url::parse("http://127.0.0.1:8500").unwrap();

    let url = kv_url(&base, to_wire("/cfg/a?b#c")).unwrap();
    assert_eq!(url.path(), "/v1/kv/cfg/a%3Fb%23c");
    assert_eq!(url.query(), None);
    assert_eq!(url.fragment(), None);

    let url = kv_url(&base, "cfg/100%").unwrap();
    assert_eq!(url.path(), "/v1/kv/cfg/100%25");

    // a listing prefix keeps its trailing separator
    assert_eq!(kv_url(&base, "cfg/").unwrap().path(), "/v1/kv/cfg/");
    assert_eq!(kv_url(&base, "").unwrap().path(), "/v1/kv/");
}

#[test]
fn endpoint_appends_to_an_address_with_a_path() {
    let base = Url::parse("https://gateway.local/consul/").unwrap();
    let url = endpoint(&base, ["v1", "txn"]).unwrap();
    assert_eq!(url.as_str(), "https://gateway.local/consul/v1/txn");
}
