//! Shared-store key layout for bucket state.

/// Identifies one resource dimension's state in the shared store.
///
/// Every limiter instance built with the same namespace and resource reads
/// and writes the same keys, and therefore draws from the same quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Namespace shared by cooperating limiter instances
    pub namespace: String,
    /// The resource dimension (for example `requests` or `tokens`)
    pub resource: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(namespace: &str, resource: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Key holding the last-write timestamp.
    pub fn last_checked_key(&self) -> String {
        format!("{}:last_checked", self)
    }

    /// Key holding the capacity at the last write.
    pub fn capacity_key(&self) -> String {
        format!("{}:capacity", self)
    }

    /// Name of this bucket's lease lock.
    pub fn lock_key(&self) -> String {
        format!("{}:lock", self)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.resource)
    }
}
