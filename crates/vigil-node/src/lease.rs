//! Scoped resource acquisition.
//!
//! Action execution touches external resources (the service being
//! restarted, a standby being promoted). A [`ResourceLease`] is acquired
//! before execution and released on every exit path (success, failure,
//! or panic) because release lives in `Drop`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Shared registry of held resource names.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the named resource, or `None` if another operation holds
    /// it.
    pub fn acquire(&self, resource: &str) -> Option<ResourceLease> {
        let mut held = self.held.lock().expect("lease lock");
        if !held.insert(resource.to_string()) {
            return None;
        }
        Some(ResourceLease {
            registry: Arc::clone(&self.held),
            resource: resource.to_string(),
        })
    }

    pub fn is_held(&self, resource: &str) -> bool {
        self.held.lock().expect("lease lock").contains(resource)
    }
}

/// A held resource; dropping releases it.
#[derive(Debug)]
pub struct ResourceLease {
    registry: Arc<Mutex<HashSet<String>>>,
    resource: String,
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.registry
            .lock()
            .expect("lease lock")
            .remove(&self.resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_and_releases_on_drop() {
        let registry = LeaseRegistry::new();
        let lease = registry.acquire("checkout-db").unwrap();
        assert!(registry.acquire("checkout-db").is_none());
        assert!(registry.is_held("checkout-db"));

        drop(lease);
        assert!(!registry.is_held("checkout-db"));
        assert!(registry.acquire("checkout-db").is_some());
    }

    #[test]
    fn lease_releases_even_on_panic() {
        let registry = LeaseRegistry::new();
        let inner = registry.clone();
        let result = std::panic::catch_unwind(move || {
            let _lease = inner.acquire("standby").unwrap();
            panic!("execution blew up");
        });
        assert!(result.is_err());
        assert!(!registry.is_held("standby"));
    }
}
