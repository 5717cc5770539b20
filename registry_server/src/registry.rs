//! The collaborators every registry operation works against.

use std::sync::Arc;

use crate::services::drone_service::CiSource;
use crate::services::retention::MaxAge;
use crate::storage::BlobStore;
use crate::store::RegistryStore;

#[derive(Clone)]
pub struct Registry {
    pub store: Arc<RegistryStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub source: Arc<dyn CiSource>,
    pub max_age: MaxAge,
}

impl Registry {
    pub fn new(
        store: Arc<RegistryStore>,
        blobs: Arc<dyn BlobStore>,
        source: Arc<dyn CiSource>,
        max_age: MaxAge,
    ) -> Self {
        Self {
            store,
            blobs,
            source,
            max_age,
        }
    }
}
