//! Viewport registry.
//!
//! Holds one [`PoolReconciler`] per configured viewport. Each pool has its own
//! lock, so a scene fans out to every viewport concurrently while snapshots
//! for the same viewport stay serialized.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use vpool_reconcile::CorrelationParam;

use crate::config::Config;
use crate::pool::{PoolReconciler, PoolSettings, ReconcileReport};
use crate::runtime::ProcessRuntime;
use crate::scene::Scene;

/// Outcome of applying a whole scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SceneReport {
    /// One report per configured viewport, in viewport order.
    pub viewports: Vec<ReconcileReport>,

    /// Scene viewports no pool serves.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored: Vec<String>,
}

impl SceneReport {
    pub fn is_clean(&self) -> bool {
        self.viewports.iter().all(ReconcileReport::is_clean)
    }
}

/// Viewport name -> pool.
pub struct PoolRegistry {
    pools: BTreeMap<String, Arc<PoolReconciler>>,
}

impl PoolRegistry {
    /// Build an empty pool for each viewport.
    pub fn new(settings: impl IntoIterator<Item = PoolSettings>, runtime: ProcessRuntime) -> Self {
        let pools = settings
            .into_iter()
            .map(|s| {
                let viewport = s.viewport.clone();
                (viewport, Arc::new(PoolReconciler::new(s, runtime.clone())))
            })
            .collect();
        Self { pools }
    }

    /// Build pools for every viewport named in `config`.
    pub fn from_config(config: &Config, runtime: ProcessRuntime) -> Self {
        let settings = config.viewports.iter().map(|viewport| {
            PoolSettings::new(config.pool_type.as_str(), viewport.as_str())
                .with_correlation(CorrelationParam::new(config.correlation_param.as_str()))
                .with_data_dir(config.data_dir.clone())
        });
        Self::new(settings, runtime)
    }

    pub fn get(&self, viewport: &str) -> Option<Arc<PoolReconciler>> {
        self.pools.get(viewport).cloned()
    }

    pub fn viewports(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<PoolReconciler>> {
        self.pools.values()
    }

    /// Reconcile every pool against `scene`.
    ///
    /// A scene is whole-state: a configured viewport the scene leaves out
    /// receives an empty snapshot.
    pub async fn apply_scene(&self, scene: &Scene) -> SceneReport {
        let ignored: Vec<String> = scene
            .viewports()
            .filter(|v| !self.pools.contains_key(*v))
            .map(str::to_string)
            .collect();
        for viewport in &ignored {
            warn!(viewport = %viewport, "Scene places windows on an unknown viewport");
        }

        let snapshots: Vec<_> = self
            .pools
            .iter()
            .map(|(viewport, pool)| (pool, scene.snapshot_for(viewport)))
            .collect();
        let viewports = join_all(
            snapshots
                .iter()
                .map(|(pool, snapshot)| pool.reconcile(snapshot)),
        )
        .await;

        SceneReport { viewports, ignored }
    }

    /// Stop every instance in every pool.
    pub async fn teardown_all(&self) -> Vec<ReconcileReport> {
        info!(pools = self.pools.len(), "Tearing down all pools");
        join_all(self.pools.values().map(|pool| pool.teardown())).await
    }
}
