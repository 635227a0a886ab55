use serde::Deserialize;
use serde::Serialize;

use crate::constants::ROOT_BUCKET;
use crate::EmbeddedConfig;

/// How keys map onto sled trees.
///
/// Flat mode keeps every key in `ROOT`. Tree mode splits at the last
/// separator: the part up to and including it names the bucket, the rest is
/// the key inside that bucket. Keys without a separator stay in `ROOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BucketLayout {
    Flat,
    Tree { separator: String },
}

impl BucketLayout {
    pub(crate) fn from_config(config: &EmbeddedConfig) -> Self {
        if config.split_key_to_buckets {
            BucketLayout::Tree {
                separator: config.bucket_separator.clone(),
            }
        } else {
            BucketLayout::Flat
        }
    }

    /// Marker persisted in the layout tree
    pub(crate) fn tag(&self) -> String {
        match self {
            BucketLayout::Flat => "flat".to_string(),
            BucketLayout::Tree { separator } => format!("tree:{separator}"),
        }
    }

    /// Bucket name and in-bucket key of `key`
    pub(crate) fn locate<'a>(
        &self,
        key: &'a str,
    ) -> (&'a str, &'a str) {
        match self {
            BucketLayout::Flat => (ROOT_BUCKET, key),
            BucketLayout::Tree { separator } => match key.rfind(separator.as_str()) {
                Some(pos) => key.split_at(pos + separator.len()),
                None => (ROOT_BUCKET, key),
            },
        }
    }

    /// Inverse of [`BucketLayout::locate`]
    pub(crate) fn full_key(
        &self,
        bucket: &str,
        inner: &str,
    ) -> String {
        if bucket == ROOT_BUCKET {
            inner.to_string()
        } else {
            format!("{bucket}{inner}")
        }
    }

    /// Which part of `bucket` a prefix scan must cover, if any
    pub(crate) fn scan_scope<'a>(
        &self,
        bucket: &str,
        prefix: &'a str,
    ) -> Option<&'a str> {
        match self {
            BucketLayout::Flat => Some(prefix),
            BucketLayout::Tree { .. } if bucket == ROOT_BUCKET => Some(prefix),
            BucketLayout::Tree { .. } => {
                if bucket.starts_with(prefix) {
                    Some("")
                } else {
                    prefix.strip_prefix(bucket)
                }
            }
        }
    }
}

/// On-disk value: payload plus the revision it was written at
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredValue {
    pub(crate) revision: u64,
    pub(crate) data: Vec<u8>,
}
