use super::*;
use crate::TxnOp;

#[test]
fn crc16_matches_reference_vector() {
    assert_eq!(crc16(b"123456789"), 0x31C3);
}

#[test]
fn hash_slot_matches_redis_cluster_slots() {
    assert_eq!(hash_slot("foo"), 12_182);
    assert_eq!(hash_slot("{user1000}.following"), hash_slot("{user1000}.followers"));
    assert_eq!(hash_slot("{user1000}.following"), hash_slot("user1000"));
    // empty tag hashes the whole key
    assert_eq!(hash_slot("foo{}{bar}"), crc16(b"foo{}{bar}") % SLOT_COUNT);
    assert!(hash_slot("anything") < SLOT_COUNT);
}

#[test]
fn slots_of_deduplicates_and_sorts() {
    let ops = vec![
        TxnOp::Put {
            key: "{a}1".into(),
            value: vec![],
        },
        TxnOp::Delete { key: "{a}2".into() },
        TxnOp::Put {
            key: "foo".into(),
            value: vec![],
        },
    ];
    let slots = slots_of(&ops);
    assert_eq!(slots.len(), 2);
    assert!(slots.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn glob_metacharacters_are_escaped() {
    assert_eq!(escape_glob("/a/b"), "/a/b");
    assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    assert_eq!(keyspace_pattern("/svc/"), "__keyspace@*__:/svc/*");
}

#[test]
fn keyspace_channel_names_the_key() {
    assert_eq!(key_from_channel("__keyspace@0__:/a/b"), Some("/a/b"));
    assert_eq!(key_from_channel("__keyspace@12__:k:with:colons"), Some("k:with:colons"));
    assert_eq!(key_from_channel("__keyevent@0__:set"), None);
    assert!(is_removal("expired"));
    assert!(!is_removal("set"));
}
