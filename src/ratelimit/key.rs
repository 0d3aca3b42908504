//! Bucket key composition.

/// A key that uniquely identifies one token bucket.
///
/// The key is composed of the configured prefix, the endpoint class and the
/// client identity, in that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(prefix: &str, endpoint_class: &str, client_key: &str) -> Self {
        Self(format!("{}{}:{}", prefix, endpoint_class, client_key))
    }

    /// The key as stored in a bucket store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
