//! Per-instance serialization of guest-metadata mutation
//!
//! Metadata injection is a read-modify-write over the guest's key/value
//! channel, so concurrent writers for the same instance must queue.
//! Different instances never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Keyed async mutexes, one per instance uuid.
///
/// Locks are created on first use and kept for the process lifetime;
/// the per-instance footprint is one `Arc<Mutex<()>>`.
#[derive(Default)]
pub struct MetadataLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the metadata lock for one instance, waiting behind any
    /// holder for the same uuid
    pub async fn lock(&self, instance_uuid: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(instance_uuid.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_instance_serializes() {
        let locks = Arc::new(MetadataLocks::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("uuid-1").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_instances_do_not_contend() {
        let locks = MetadataLocks::new();

        let _a = locks.lock("uuid-1").await;
        // A second instance's lock must be acquirable while the first
        // is held.
        let _b = locks.lock("uuid-2").await;
    }
}
