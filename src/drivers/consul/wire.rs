use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Url;
use serde::Deserialize;
use serde::Serialize;

use crate::ChangeEvent;
use crate::Error;
use crate::Result;
use crate::TxnOp;

/// One entry of a `/v1/kv` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct KvEntry {
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) value: Option<String>,
    #[serde(default)]
    pub(crate) modify_index: u64,
}

impl KvEntry {
    pub(crate) fn decode_value(&self) -> Result<Vec<u8>> {
        match &self.value {
            Some(encoded) => Ok(STANDARD.decode(encoded)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SessionRequest {
    pub(crate) name: String,
    #[serde(rename = "TTL")]
    pub(crate) ttl: String,
    pub(crate) behavior: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionResponse {
    #[serde(rename = "ID")]
    pub(crate) id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TxnEnvelope {
    #[serde(rename = "KV")]
    pub(crate) kv: TxnKv,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct TxnKv {
    pub(crate) verb: &'static str,
    pub(crate) key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) value: Option<String>,
}

/// `base` extended by `segments`, each escaped as a single path segment
pub(crate) fn endpoint<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::invalid(format!("consul address {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `/v1/kv/<key>`: `/` keeps separating segments, `?`, `#` and `%` are
/// escaped so they stay part of the key.
pub(crate) fn kv_url(
    base: &Url,
    wire_key: &str,
) -> Result<Url> {
    endpoint(base, ["v1", "kv"].into_iter().chain(wire_key.split('/')))
}

/// Consul keys never start with `/`.
pub(crate) fn to_wire(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}

/// Restores the leading `/` when the caller asked with one.
pub(crate) fn from_wire(
    requested: &str,
    wire: &str,
) -> String {
    if requested.starts_with('/') && !wire.starts_with('/') {
        format!("/{wire}")
    } else {
        wire.to_string()
    }
}

pub(crate) fn txn_body(ops: &[TxnOp]) -> Vec<TxnEnvelope> {
    ops.iter()
        .map(|op| TxnEnvelope {
            kv: match op {
                TxnOp::Put { key, value } => TxnKv {
                    verb: "set",
                    key: to_wire(key).to_string(),
                    value: Some(STANDARD.encode(value)),
                },
                TxnOp::Delete { key } => TxnKv {
                    verb: "delete",
                    key: to_wire(key).to_string(),
                    value: None,
                },
            },
        })
        .collect()
}

/// Session TTL; Consul accepts 10s to 24h.
pub(crate) fn session_ttl(ttl: std::time::Duration) -> String {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    format!("{}s", secs.clamp(10, 86_400))
}

/// Key to (value, modify index) as last seen by a blocking query
pub(crate) type Snapshot = BTreeMap<String, (Vec<u8>, u64)>;

/// Put for every new or modified entry, Delete for every vanished one.
/// Deletes carry `index`, the index of the query that noticed them.
pub(crate) fn diff_snapshots(
    old: &Snapshot,
    new: &Snapshot,
    index: u64,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (key, (value, index)) in new {
        match old.get(key) {
            Some((_, old_index)) if old_index == index => {}
            Some((prev, _)) => events.push(ChangeEvent::put(key.clone(), value.clone(), Some(prev.clone()), *index)),
            None => events.push(ChangeEvent::put(key.clone(), value.clone(), None, *index)),
        }
    }
    for (key, (prev, _)) in old {
        if !new.contains_key(key) {
            events.push(ChangeEvent::delete(key.clone(), Some(prev.clone()), index));
        }
    }
    events
}

/// Index to send with the next blocking query.
///
/// Consul may hand out a smaller index after a leader change or snapshot
/// restore; the wait then starts over.
pub(crate) fn next_index(
    previous: u64,
    returned: u64,
) -> u64 {
    if returned < previous {
        0
    } else {
        returned
    }
}
