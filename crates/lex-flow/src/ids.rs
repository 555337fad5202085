//! Identifier sources for container files and generated tables.
//!
//! Identifiers must be usable both as file stems and as the tail of a SQL
//! identifier, so generators only emit `[a-z0-9_]` characters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces process-unique identifiers.
pub trait IdGenerator: Send + Sync {
    /// Return a fresh identifier. Never returns the same value twice.
    fn next_id(&self) -> String;
}

/// Random identifiers backed by UUID v4 (hyphens removed).
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic, monotonically increasing identifiers.
///
/// Useful in tests that assert on generated table or file names.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Create a generator yielding `{prefix}{n}` starting at `n = 0`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new("")
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}{:06}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_ids_are_identifier_safe() {
        let ids = UuidIdGenerator;
        let id = ids.next_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uuid_ids_do_not_repeat() {
        let ids = UuidIdGenerator;
        let seen: HashSet<String> = (0..100).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("run_");
        assert_eq!(ids.next_id(), "run_000000");
        assert_eq!(ids.next_id(), "run_000001");
    }
}
