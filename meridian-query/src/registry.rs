//! The query registry: kill handles for running queries.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// A shared kill flag. Cloned into every engine of a query; checked at
/// every execution entry point.
#[derive(Clone, Debug, Default)]
pub struct KillHandle(Arc<AtomicBool>);

impl KillHandle {
    pub fn kill(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Registry of running queries per database.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    inner: Arc<Mutex<HashMap<(String, u64), KillHandle>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query, returning its kill handle.
    pub fn open(&self, database: &str, query_id: u64) -> KillHandle {
        let handle = KillHandle::default();
        let mut inner = self.inner.lock().expect("query registry lock poisoned");
        inner.insert((database.to_string(), query_id), handle.clone());
        handle
    }

    /// Drop a finished query's registration. The kill flag itself stays
    /// valid for engines still holding it.
    pub fn close(&self, database: &str, query_id: u64) {
        let mut inner = self.inner.lock().expect("query registry lock poisoned");
        inner.remove(&(database.to_string(), query_id));
    }

    /// Kill a running query. Returns false when it is not registered.
    pub fn kill(&self, database: &str, query_id: u64) -> bool {
        let inner = self.inner.lock().expect("query registry lock poisoned");
        match inner.get(&(database.to_string(), query_id)) {
            Some(handle) => {
                tracing::info!(database, query_id, "killing query");
                handle.kill();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_reaches_cloned_handles() {
        let registry = QueryRegistry::new();
        let handle = registry.open("db", 7);
        let clone = handle.clone();
        assert!(!clone.is_killed());

        assert!(registry.kill("db", 7));
        assert!(clone.is_killed());

        registry.close("db", 7);
        assert!(!registry.kill("db", 7));
        // The flag stays observable after close.
        assert!(handle.is_killed());
    }
}
