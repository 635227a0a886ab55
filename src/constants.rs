/// Magic prefix of an encrypted string field
pub const CRYPTO_MARKER: &str = "$crypto$";

/// Envelope field flagging a JSON value that carries encrypted fields
pub const ENCRYPTED_FIELD: &str = "encrypted";

// -
// Embedded database namespaces

/// Bucket holding every key in flat mode
pub(crate) const ROOT_BUCKET: &str = "ROOT";

/// Tree recording the bucket layout the database was created with
pub(crate) const LAYOUT_META_TREE: &str = "__unikv_layout";
pub(crate) const LAYOUT_META_KEY: &str = "layout";

/// Health probe key, `<backend>` is replaced by the backend name
pub(crate) fn probe_key(backend: &str) -> String {
    format!("/probe-{backend}-connection")
}
