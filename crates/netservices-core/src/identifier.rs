//! Correlation id strategies.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces correlation ids for outbound calls.
///
/// Ids must stay unique for the lifetime of the registry that uses the generator.
pub trait IdentifierGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Monotonically increasing counter, stringified. The first id is `"1"`.
#[derive(Debug, Default)]
pub struct NumericIdentifierGenerator {
    last: AtomicU64,
}

impl NumericIdentifierGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentifierGenerator for NumericIdentifierGenerator {
    fn next_id(&self) -> String {
        (self.last.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// Random v4 UUIDs; safe to share across unrelated connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdentifierGenerator;

impl IdentifierGenerator for UuidIdentifierGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
