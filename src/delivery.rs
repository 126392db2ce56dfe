//! Client-delivery handles
//!
//! A single-URL run in client mode parks its finished file in a short-lived
//! handle instead of the library. Exactly one consumer may claim a handle;
//! a watcher task removes the file at expiry or after successful pickup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const DEFAULT_DELIVERY_TTL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    pub id: String,
    pub path: PathBuf,
    pub filename: String,
    pub expires_at: DateTime<Utc>,
    pub served: bool,
    pub delivered: bool,
}

#[derive(Clone)]
pub struct DeliveryRegistry {
    inner: Arc<Mutex<HashMap<String, DeliveryHandle>>>,
    ttl: Duration,
}

impl Default for DeliveryRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DELIVERY_TTL_SECS))
    }
}

impl DeliveryRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Register a finished file and start its expiry watcher.
    pub fn register(&self, path: PathBuf, filename: String) -> DeliveryHandle {
        let handle = DeliveryHandle {
            id: Uuid::new_v4().simple().to_string(),
            path,
            filename,
            expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            served: false,
            delivered: false,
        };
        self.inner
            .lock()
            .expect("delivery lock poisoned")
            .insert(handle.id.clone(), handle.clone());

        let registry = self.clone();
        let id = handle.id.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            registry.expire(&id);
        });

        handle
    }

    /// Claim a handle for pickup. The first caller wins; later calls and
    /// expired handles get None.
    pub fn claim(&self, id: &str) -> Option<DeliveryHandle> {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");
        let handle = inner.get_mut(id)?;
        if handle.served || Utc::now() >= handle.expires_at {
            return None;
        }
        handle.served = true;
        Some(handle.clone())
    }

    /// Mark a claimed handle delivered and delete its file.
    pub fn complete(&self, id: &str) {
        let removed = self
            .inner
            .lock()
            .expect("delivery lock poisoned")
            .remove(id);
        if let Some(handle) = removed {
            if let Err(err) = std::fs::remove_file(&handle.path) {
                log::debug!("Delivery file already gone {}: {err}", handle.path.display());
            }
            log::info!("Client delivery {id} picked up ({})", handle.filename);
        }
    }

    /// Drop a handle still present at expiry, claimed or not: a pickup that
    /// never finished must not leak the file.
    fn expire(&self, id: &str) {
        let removed = self
            .inner
            .lock()
            .expect("delivery lock poisoned")
            .remove(id);
        if let Some(handle) = removed {
            log::info!("Client delivery {id} expired; removing {}", handle.path.display());
            let _ = std::fs::remove_file(&handle.path);
        }
    }

    pub fn get(&self, id: &str) -> Option<DeliveryHandle> {
        self.inner
            .lock()
            .expect("delivery lock poisoned")
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let registry = DeliveryRegistry::new(Duration::from_secs(60));
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.webm");
        std::fs::write(&file, b"media").unwrap();

        let handle = registry.register(file.clone(), "a.webm".to_string());
        assert!(registry.get(&handle.id).is_some());

        let first = registry.claim(&handle.id);
        assert!(first.is_some());
        let second = registry.claim(&handle.id);
        assert!(second.is_none());

        registry.complete(&handle.id);
        assert!(registry.get(&handle.id).is_none());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_expiry_removes_file() {
        let registry = DeliveryRegistry::new(Duration::from_millis(50));
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("b.webm");
        std::fs::write(&file, b"media").unwrap();

        let handle = registry.register(file.clone(), "b.webm".to_string());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&handle.id).is_none());
        assert!(!file.exists());
        assert!(registry.claim(&handle.id).is_none());
    }
}
