use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ChangeEvent;
use crate::EventKind;

#[derive(Debug, PartialEq, Eq)]
enum Delivered {
    Put(Vec<u8>),
    Delete,
}

/// Suppresses an identical consecutive Put and a repeated Delete per key.
///
/// The first Put seen for a key is also dropped when the backend reports a
/// previous value equal to the new one.
#[derive(Debug, Default)]
pub(crate) struct DedupFilter {
    last: Mutex<HashMap<String, Delivered>>,
}

impl DedupFilter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True when `event` must be delivered; records it as delivered.
    pub(crate) fn admit(
        &self,
        event: &ChangeEvent,
    ) -> bool {
        let mut last = self.last.lock();
        let duplicate = match (event.kind, last.get(&event.key)) {
            (EventKind::Put, Some(Delivered::Put(prev))) => event.value.as_ref() == Some(prev),
            (EventKind::Delete, Some(Delivered::Delete)) => true,
            (EventKind::Put, None) => event.prev_value.is_some() && event.prev_value == event.value,
            _ => false,
        };
        if duplicate {
            return false;
        }

        let delivered = match event.kind {
            EventKind::Put => Delivered::Put(event.value.clone().unwrap_or_default()),
            EventKind::Delete => Delivered::Delete,
        };
        last.insert(event.key.clone(), delivered);
        true
    }

    pub(crate) fn forget(
        &self,
        key_prefix: &str,
    ) {
        self.last.lock().retain(|k, _| !k.starts_with(key_prefix));
    }
}
