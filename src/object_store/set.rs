use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ImageStore, StoreError};
use crate::object::StoreObject;

/// The process-wide set of configured stores, built once at startup.
///
/// Every upload is written to every store. The first store is the primary:
/// it supplies URLs.
#[derive(Clone)]
pub struct StoreSet {
    stores: Vec<Arc<dyn ImageStore>>,
}

impl StoreSet {
    /// Returns `None` for an empty list; a set always has a primary.
    pub fn new(stores: Vec<Arc<dyn ImageStore>>) -> Option<Self> {
        if stores.is_empty() {
            None
        } else {
            Some(Self { stores })
        }
    }

    pub fn primary(&self) -> &Arc<dyn ImageStore> {
        &self.stores[0]
    }
}

#[async_trait]
impl ImageStore for StoreSet {
    async fn save(&self, object: &StoreObject, data: Bytes) -> Result<String, StoreError> {
        for store in &self.stores {
            store.save(object, data.clone()).await?;
        }
        Ok(self.url_for(object.name()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        for store in &self.stores {
            if store.exists(name).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get(&self, name: &str) -> Result<Bytes, StoreError> {
        for store in &self.stores {
            match store.get(name).await {
                Err(StoreError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(StoreError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut deleted = false;
        for store in &self.stores {
            match store.delete(name).await {
                Ok(()) => deleted = true,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if deleted {
            Ok(())
        } else {
            Err(StoreError::NotFound(name.to_string()))
        }
    }

    fn url_for(&self, name: &str) -> String {
        self.primary().url_for(name)
    }
}
