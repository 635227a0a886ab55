use crate::Error;
use crate::Result;

/// Rejects keys the contract does not allow: empty or carrying NUL.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid("key must not be empty"));
    }
    if key.contains('\0') {
        return Err(Error::invalid(format!("key {key:?} contains NUL")));
    }
    Ok(())
}

/// Byte-level prefix match; the empty prefix matches every key.
#[inline]
pub fn has_prefix(
    key: &str,
    prefix: &str,
) -> bool {
    key.as_bytes().starts_with(prefix.as_bytes())
}

/// `prefix + key`, the write path of a scoped view
#[inline]
pub(crate) fn join_prefix(
    prefix: &str,
    key: &str,
) -> String {
    let mut full = String::with_capacity(prefix.len() + key.len());
    full.push_str(prefix);
    full.push_str(key);
    full
}

/// Inverse of [`join_prefix`]; `None` when `key` lies outside the view.
#[inline]
pub(crate) fn trim_prefix(
    key: &str,
    prefix: &str,
) -> Option<String> {
    key.strip_prefix(prefix).map(str::to_string)
}
