use super::*;
use crate::ErrorKind;

#[test]
fn validate_key_should_reject_empty_and_nul() {
    assert_eq!(validate_key("").unwrap_err().kind(), ErrorKind::Invalid);
    assert_eq!(validate_key("a\0b").unwrap_err().kind(), ErrorKind::Invalid);
    assert!(validate_key("/a/b").is_ok());
}

#[test]
fn has_prefix_is_byte_level() {
    assert!(has_prefix("/a/key", ""));
    assert!(has_prefix("/a/key", "/a/k"));
    assert!(!has_prefix("/a", "/a/"));
}

#[test]
fn join_and_trim_are_inverse() {
    let full = join_prefix("/my/", "key1");
    assert_eq!(full, "/my/key1");
    assert_eq!(trim_prefix(&full, "/my/").as_deref(), Some("key1"));
    assert_eq!(trim_prefix("/other/key1", "/my/"), None);
}
