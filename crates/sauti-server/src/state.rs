//! Shared application state handed to every handler.

use std::sync::Arc;

use sauti_core::{BlobStore, JobStore};

#[derive(Clone)]
pub struct AppState {
    /// Durable queue and batch records.
    pub store: JobStore,
    /// Uploaded references and generated results.
    pub blobs: Arc<BlobStore>,
    /// Required `x-api-key` value; `None` leaves the API open.
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(store: JobStore, blobs: Arc<BlobStore>, api_key: Option<String>) -> Self {
        Self {
            store,
            blobs,
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .map(Arc::from),
        }
    }
}
