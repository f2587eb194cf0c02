use std::collections::HashMap;
use std::sync::Mutex;

/// Keyed rotation counter behind an atomic fetch-add interface.
///
/// The cursor is the only mutable state the core shares across concurrent
/// requests. Keeping it behind a trait lets deployments replace the
/// in-process map with an external keyed store (e.g. a Redis `INCR`) so
/// multiple gateway instances rotate consistently.
pub trait CursorStore: Send + Sync {
    /// Returns the current cursor value for `key` and advances it by one,
    /// as a single serialized operation.
    fn next(&self, key: &str) -> u64;
}

/// Process-local cursor store. A single mutex over the key map gives the
/// fetch-add the required serialization; contention is one increment per
/// request.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<String, u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for InMemoryCursorStore {
    fn next(&self, key: &str) -> u64 {
        let mut cursors = self
            .cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = cursors.entry(key.to_string()).or_insert(0);
        let current = *slot;
        *slot = slot.wrapping_add(1);
        current
    }
}
