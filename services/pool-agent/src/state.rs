//! Application state shared across request handlers.

use std::sync::Arc;

use crate::registry::PoolRegistry;
use crate::scene::SceneDecoder;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<PoolRegistry>,
    decoder: SceneDecoder,
}

impl AppState {
    /// Create a new application state.
    pub fn new(registry: Arc<PoolRegistry>, decoder: SceneDecoder) -> Self {
        Self {
            inner: Arc::new(AppStateInner { registry, decoder }),
        }
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.inner.registry
    }

    pub fn decoder(&self) -> &SceneDecoder {
        &self.inner.decoder
    }
}
