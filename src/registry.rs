//! Keyed ownership of running tunnels and gateways.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Something a registry can shut down before releasing it
#[async_trait]
pub trait Stoppable: Send + Sync {
    type Error: Display + Send;

    async fn stop(&self) -> Result<(), Self::Error>;
}

/// Process-wide map from a caller-chosen key to a running instance.
///
/// Every operation runs under one registry-wide lock, including the `stop`
/// calls it makes, so creation and removal of the same key never interleave.
/// An entry is always evicted once its teardown has been attempted.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Stoppable> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` under `key`, stopping whatever was there before
    pub async fn store(&self, key: impl Into<String>, item: Arc<T>) {
        let key = key.into();
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(key.clone(), item.clone()) {
            if !Arc::ptr_eq(&previous, &item) {
                if let Err(e) = previous.stop().await {
                    tracing::warn!("Stopping replaced entry '{}' failed: {}", key, e);
                }
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Stop and evict `key`. A missing key is a no-op.
    pub async fn remove(&self, key: &str) -> Result<(), T::Error> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(item) => item.stop().await,
            None => Ok(()),
        }
    }

    /// Stop and evict every entry. Failures are logged and returned but never
    /// cut the sweep short.
    pub async fn tear_down_all(&self) -> Vec<(String, T::Error)> {
        let mut entries = self.entries.lock().await;
        let mut failures = Vec::new();
        for (key, item) in entries.drain() {
            if let Err(e) = item.stop().await {
                tracing::warn!("Teardown of '{}' failed: {}", key, e);
                failures.push((key, e));
            }
        }
        failures
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Service {
        stops: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Stoppable for Service {
        type Error = String;

        async fn stop(&self) -> Result<(), String> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err("boom".to_string()) } else { Ok(()) }
        }
    }

    #[tokio::test]
    async fn remove_missing_key_is_noop() {
        let registry: Registry<Service> = Registry::new();
        assert!(registry.remove("nope").await.is_ok());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_stops_then_evicts() {
        let registry = Registry::new();
        let service = Arc::new(Service::default());
        registry.store("k", service.clone()).await;
        assert!(registry.get("k").await.is_some());

        registry.remove("k").await.unwrap();
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert!(registry.get("k").await.is_none());
    }

    #[tokio::test]
    async fn failing_stop_still_evicts() {
        let registry = Registry::new();
        let service = Arc::new(Service {
            fail: true,
            ..Default::default()
        });
        registry.store("k", service).await;

        assert_eq!(registry.remove("k").await, Err("boom".to_string()));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn store_replaces_and_stops_previous() {
        let registry = Registry::new();
        let first = Arc::new(Service::default());
        let second = Arc::new(Service::default());

        registry.store("k", first.clone()).await;
        registry.store("k", first.clone()).await;
        assert_eq!(first.stops.load(Ordering::SeqCst), 0);

        registry.store("k", second.clone()).await;
        assert_eq!(first.stops.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&registry.get("k").await.unwrap(), &second));
    }

    #[tokio::test]
    async fn tear_down_all_survives_failures() {
        let registry = Registry::new();
        let mut services = Vec::new();
        for i in 0..5 {
            let service = Arc::new(Service {
                fail: i == 2,
                ..Default::default()
            });
            registry.store(format!("k{i}"), service.clone()).await;
            services.push(service);
        }

        let failures = registry.tear_down_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "k2");
        assert!(registry.is_empty().await);
        assert!(services.iter().all(|p| p.stops.load(Ordering::SeqCst) == 1));
    }
}
