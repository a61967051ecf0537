//! Cache key definitions.
//!
//! A [`CacheKey`] pairs an origin object key with the ordered labels of the
//! transform applied to it. The on-disk filename is derived from both with
//! `encodeURIComponent`-compatible escaping so that existing cache
//! directories stay readable.

use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Bytes left unescaped by `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const LABEL_SEPARATOR: &str = "_";

/// Prefix reserved for in-progress writes. Never produced by [`CacheKey::file_name`].
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    object_key: String,
    labels: Vec<String>,
}

impl CacheKey {
    pub fn new(object_key: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            object_key: object_key.into(),
            labels,
        }
    }

    /// Key for an untransformed original.
    pub fn original(object_key: impl Into<String>) -> Self {
        Self::new(object_key, Vec::new())
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Filename of this entry inside the cache root.
    pub fn file_name(&self) -> String {
        let mut name = utf8_percent_encode(&self.object_key, COMPONENT).to_string();

        if !self.labels.is_empty() {
            name.push_str(LABEL_SEPARATOR);
            let joined = self.labels.join(LABEL_SEPARATOR);
            name.extend(utf8_percent_encode(&joined, COMPONENT));
        }

        // `.`/`..` would resolve to directories and `.tmp-` is reserved.
        if let Some(rest) = name.strip_prefix('.') {
            name = format!("%2E{rest}");
        }

        name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            f.write_str(&self.object_key)
        } else {
            write!(f, "{}[{}]", self.object_key, self.labels.join(","))
        }
    }
}
