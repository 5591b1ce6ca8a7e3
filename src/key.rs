//! Dedup and cache key normalization.
//!
//! Two logically identical calls must always produce the same key, regardless
//! of header-name casing or insertion order. Credential headers never
//! participate in identity. The cache and the future registry share this
//! normalization, so a cached value and an in-flight future for the same
//! logical call can never disagree about what "same" means.

use std::collections::BTreeMap;

use crate::model::RequestOptions;

/// Headers excluded from key normalization: they vary per session without
/// changing what the call returns.
const VOLATILE_HEADERS: [&str; 2] = ["authorization", "cookie"];

/// Deterministic string identity for a dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build the key for an endpoint call.
    ///
    /// Format: `METHOD:endpoint`, then `?h=name=value&...` for the surviving
    /// headers (lowercased names, sorted), then `|b=body` for non-idempotent
    /// methods carrying a body.
    pub fn normalize(endpoint: &str, options: &RequestOptions) -> Self {
        let mut key = format!("{}:{}", options.method, endpoint);

        let headers: BTreeMap<String, &str> = options
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .filter(|(name, _)| !VOLATILE_HEADERS.contains(&name.as_str()))
            .collect();

        if !headers.is_empty() {
            key.push_str("?h=");
            let mut first = true;
            for (name, value) in &headers {
                if !first {
                    key.push('&');
                }
                key.push_str(name);
                key.push('=');
                key.push_str(value);
                first = false;
            }
        }

        if !options.method.is_idempotent() {
            if let Some(body) = &options.body {
                key.push_str("|b=");
                key.push_str(body);
            }
        }

        Self(key)
    }

    /// Key for a batch load: order of the input list is irrelevant.
    pub fn for_batch(urls: &[String]) -> Self {
        let mut sorted: Vec<&str> = urls.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        Self(format!("BATCH:{}", sorted.join(",")))
    }

    /// Key for a single resource load.
    pub fn for_single(url: &str) -> Self {
        Self(format!("LOAD:{url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RequestKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
