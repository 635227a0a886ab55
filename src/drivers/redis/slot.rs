//! Cluster hash slots and key pattern helpers.

use std::collections::BTreeSet;

use crate::TxnOp;

pub(crate) const SLOT_COUNT: u16 = 16_384;

/// CRC16-XMODEM as used by Redis Cluster
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// Slot of `key`, honouring a non-empty `{hashtag}`
pub(crate) fn hash_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let tagged = bytes.iter().position(|b| *b == b'{').and_then(|open| {
        bytes[open + 1..]
            .iter()
            .position(|b| *b == b'}')
            .filter(|len| *len > 0)
            .map(|len| &bytes[open + 1..open + 1 + len])
    });
    crc16(tagged.unwrap_or(bytes)) % SLOT_COUNT
}

/// Distinct slots touched by `ops`, ascending
pub(crate) fn slots_of(ops: &[TxnOp]) -> Vec<u16> {
    ops.iter()
        .map(|op| hash_slot(op.key()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Escapes glob metacharacters so `prefix` matches literally.
pub(crate) fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Keyspace channel pattern covering every key under `prefix` in any database
pub(crate) fn keyspace_pattern(prefix: &str) -> String {
    format!("__keyspace@*__:{}*", escape_glob(prefix))
}

/// Key named by a keyspace notification channel
pub(crate) fn key_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("__keyspace@")
        .and_then(|rest| rest.split_once("__:"))
        .map(|(_, key)| key)
}

/// Whether a keyspace notification means the key is gone
pub(crate) fn is_removal(op: &str) -> bool {
    matches!(op, "del" | "expired" | "evicted" | "rename_from" | "unlink")
}
