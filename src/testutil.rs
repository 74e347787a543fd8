//! Shared test helpers for image-store unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::object::StoreObject;
use crate::object_store::{ImageStore, StoreError};

/// In-memory store with switchable failure modes.
pub struct MemoryStore {
    scheme: String,
    objects: Mutex<HashMap<String, Bytes>>,
    fail_queries: AtomicBool,
    always_exists: AtomicBool,
    exists_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            objects: Mutex::new(HashMap::new()),
            fail_queries: AtomicBool::new(false),
            always_exists: AtomicBool::new(false),
            exists_calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, name: &str, data: &'static str) {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), Bytes::from(data));
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Make `exists` fail with a query error.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make `exists` report every name as taken.
    pub fn always_exists(&self, occupied: bool) {
        self.always_exists.store(occupied, Ordering::SeqCst);
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .insert(object.name().to_string(), data);
        Ok(self.url_for(object.name()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Query("injected failure".to_string()));
        }
        if self.always_exists.load(Ordering::SeqCst) {
            return Ok(true);
        }
        Ok(self.objects.lock().unwrap().contains_key(name))
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}://{name}", self.scheme)
    }
}
