//! Pool reconciler: converges one viewport's instances onto desired snapshots.
//!
//! The reconciler:
//! - Plans remove / relabel / create / update actions by URL identity
//! - Applies them in that order under one exclusive lock
//! - Isolates per-instance failures and reports them in a batch report
//!
//! Every mutating call and the describe query take the same lock, so a
//! snapshot arriving mid-reconciliation waits and then converges against the
//! latest state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vpool_reconcile::{correlation_token, plan_actions, CorrelationParam, MatchKey};

use crate::instance::{
    InstanceDescription, InstanceError, InstanceSpec, InstanceStatus, ManagedInstance, Visibility,
};
use crate::model::{DesiredItem, DesiredSnapshot};
use crate::runtime::ProcessRuntime;

/// Static settings for one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Pool type, first component of the correlation token.
    pub pool_type: String,

    /// Viewport this pool manages.
    pub viewport: String,

    /// Query parameter carrying the correlation token.
    pub correlation: CorrelationParam,

    /// Root for per-instance scratch directories. None disables them.
    pub data_dir: Option<PathBuf>,
}

impl PoolSettings {
    pub fn new(pool_type: impl Into<String>, viewport: impl Into<String>) -> Self {
        Self {
            pool_type: pool_type.into(),
            viewport: viewport.into(),
            correlation: CorrelationParam::default(),
            data_dir: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationParam) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }
}

/// The step an instance failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAction {
    Remove,
    Create,
    Show,
    UpdateUrl,
    UpdateGeometry,
    Relaunch,
}

/// One isolated per-instance failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceFailure {
    pub id: String,
    pub action: PoolAction,
    pub error: String,
}

/// A live instance that now answers to a new id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relabeled {
    pub from: String,
    pub to: String,
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub viewport: String,

    /// Reconciliation counter after this call.
    pub generation: u64,

    /// Fingerprint of the applied snapshot.
    pub snapshot_hash: String,

    pub removed: Vec<String>,
    pub relabeled: Vec<Relabeled>,
    pub created: Vec<String>,

    /// Ids whose URL was re-pointed.
    pub navigated: Vec<String>,

    pub failures: Vec<InstanceFailure>,
}

impl ReconcileReport {
    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns true if no process was started or stopped.
    pub fn is_steady(&self) -> bool {
        self.removed.is_empty() && self.created.is_empty()
    }

    pub fn failed(&self, id: &str) -> bool {
        self.failures.iter().any(|f| f.id == id)
    }

    fn fail(&mut self, id: &str, action: PoolAction, error: &InstanceError) {
        self.failures.push(InstanceFailure {
            id: id.to_string(),
            action,
            error: error.to_string(),
        });
    }
}

/// Outcome of a soft relaunch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelaunchReport {
    pub viewport: String,
    pub relaunched: Vec<String>,
    pub failures: Vec<InstanceFailure>,
}

/// Consistent view of a pool, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDescription {
    pub viewport: String,
    pub pool_type: String,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub instances: Vec<InstanceDescription>,
}

impl PoolDescription {
    pub fn ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&InstanceDescription> {
        self.instances.iter().find(|i| i.id == id)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    instances: BTreeMap<String, ManagedInstance>,
    generation: u64,
    last_snapshot_hash: Option<String>,
    last_reconciled_at: Option<DateTime<Utc>>,
}

/// Authoritative id -> instance map for one viewport.
pub struct PoolReconciler {
    settings: PoolSettings,
    runtime: ProcessRuntime,
    state: Mutex<PoolState>,
}

impl PoolReconciler {
    /// Create an empty pool.
    pub fn new(settings: PoolSettings, runtime: ProcessRuntime) -> Self {
        Self {
            settings,
            runtime,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn viewport(&self) -> &str {
        &self.settings.viewport
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Converge the pool onto `snapshot`.
    ///
    /// Never fails as a whole: per-instance failures are logged, isolated,
    /// and listed in the report. An identical snapshot sent again is the
    /// retry mechanism.
    pub async fn reconcile(&self, snapshot: &DesiredSnapshot) -> ReconcileReport {
        let mut state = self.state.lock().await;
        let viewport = self.settings.viewport.as_str();

        let items = snapshot.deduplicated();
        if items.len() != snapshot.items.len() {
            warn!(
                viewport = %viewport,
                received = snapshot.items.len(),
                unique = items.len(),
                "Snapshot repeats ids, later items win"
            );
        }

        let current: Vec<MatchKey> = state
            .instances
            .values()
            .map(|i| MatchKey::new(i.id(), self.normalize(i.url())))
            .collect();
        let desired: Vec<MatchKey> = items
            .iter()
            .map(|i| MatchKey::new(i.id.as_str(), self.normalize(&i.url)))
            .collect();
        let plan = plan_actions(&current, &desired);

        info!(
            viewport = %viewport,
            current = current.len(),
            desired = desired.len(),
            remove = plan.remove.len(),
            relabel = plan.relabel.len(),
            create = plan.create.len(),
            update = plan.update.len(),
            "Applying snapshot"
        );

        let by_id: HashMap<&str, &DesiredItem> =
            items.iter().map(|i| (i.id.as_str(), i)).collect();
        let mut report = ReconcileReport {
            viewport: viewport.to_string(),
            snapshot_hash: snapshot.state_hash().to_string(),
            ..ReconcileReport::default()
        };

        // Stale instances go first so their resources are free for creates.
        for id in &plan.remove {
            let Some(mut instance) = state.instances.remove(id) else {
                continue;
            };
            info!(viewport = %viewport, instance_id = %id, "Removing instance");
            if let Err(e) = instance.stop().await {
                error!(viewport = %viewport, instance_id = %id, error = %e, "Failed to stop instance");
                report.fail(id, PoolAction::Remove, &e);
            }
            report.removed.push(id.clone());
        }

        for relabel in &plan.relabel {
            let Some(mut instance) = state.instances.remove(&relabel.from) else {
                continue;
            };
            info!(
                viewport = %viewport,
                from = %relabel.from,
                to = %relabel.to,
                token = %instance.token(),
                "Keeping instance under new id"
            );
            instance.relabel(relabel.to.as_str());
            state.instances.insert(relabel.to.clone(), instance);
            report.relabeled.push(Relabeled {
                from: relabel.from.clone(),
                to: relabel.to.clone(),
            });
        }

        for id in &plan.create {
            let Some(item) = by_id.get(id.as_str()) else {
                continue;
            };
            let mut instance = self.build_instance(&state.instances, item);
            info!(
                viewport = %viewport,
                instance_id = %id,
                url = %instance.url(),
                geometry = %item.geometry,
                "Creating instance"
            );

            if let Err(e) = instance.start().await {
                error!(viewport = %viewport, instance_id = %id, error = %e, "Failed to create instance");
                report.fail(id, PoolAction::Create, &e);
                continue;
            }
            if let Err(e) = instance.set_visibility(Visibility::Visible).await {
                warn!(viewport = %viewport, instance_id = %id, error = %e, "Instance started but not shown");
                report.fail(id, PoolAction::Show, &e);
            }

            state.instances.insert(id.clone(), instance);
            report.created.push(id.clone());
        }

        for id in &plan.update {
            let (Some(item), Some(instance)) =
                (by_id.get(id.as_str()), state.instances.get_mut(id))
            else {
                continue;
            };
            self.update_instance(instance, item, &mut report).await;

            // No process is left behind it; the next snapshot recreates it.
            if !instance.status().is_running() {
                warn!(viewport = %viewport, instance_id = %id, "Dropping instance without a process");
                state.instances.remove(id);
            }
        }

        state.generation += 1;
        state.last_snapshot_hash = Some(report.snapshot_hash.clone());
        state.last_reconciled_at = Some(Utc::now());
        report.generation = state.generation;

        info!(
            viewport = %viewport,
            generation = report.generation,
            instances = state.instances.len(),
            failures = report.failures.len(),
            "Snapshot applied"
        );

        report
    }

    /// Consistent view of the pool.
    pub async fn describe_state(&self) -> PoolDescription {
        let state = self.state.lock().await;
        PoolDescription {
            viewport: self.settings.viewport.clone(),
            pool_type: self.settings.pool_type.clone(),
            generation: state.generation,
            last_snapshot_hash: state.last_snapshot_hash.clone(),
            last_reconciled_at: state.last_reconciled_at,
            instances: state.instances.values().map(|i| i.describe()).collect(),
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    /// Restart every instance with its current URL and geometry.
    pub async fn relaunch(&self) -> RelaunchReport {
        let mut state = self.state.lock().await;
        let viewport = self.settings.viewport.as_str();
        let mut report = RelaunchReport {
            viewport: viewport.to_string(),
            ..RelaunchReport::default()
        };

        info!(viewport = %viewport, instances = state.instances.len(), "Relaunching pool");

        let ids: Vec<String> = state.instances.keys().cloned().collect();
        for id in ids {
            let Some(mut old) = state.instances.remove(&id) else {
                continue;
            };
            let spec = old.spec().clone();
            if let Err(e) = old.stop().await {
                warn!(viewport = %viewport, instance_id = %id, error = %e, "Failed to stop instance for relaunch");
            }

            let mut fresh = ManagedInstance::new(spec, self.runtime.clone());
            let started = match fresh.start().await {
                Ok(()) => fresh.set_visibility(Visibility::Visible).await,
                Err(e) => Err(e),
            };

            match started {
                Ok(()) => {
                    state.instances.insert(id.clone(), fresh);
                    report.relaunched.push(id);
                }
                Err(e) => {
                    error!(viewport = %viewport, instance_id = %id, error = %e, "Failed to relaunch instance");
                    report.failures.push(InstanceFailure {
                        id: id.clone(),
                        action: PoolAction::Relaunch,
                        error: e.to_string(),
                    });
                    if fresh.status().is_running() {
                        state.instances.insert(id, fresh);
                    }
                }
            }
        }

        report
    }

    /// Stop every instance.
    pub async fn teardown(&self) -> ReconcileReport {
        info!(viewport = %self.settings.viewport, "Tearing down pool");
        self.reconcile(&DesiredSnapshot::empty()).await
    }

    fn normalize(&self, url: &str) -> String {
        self.settings.correlation.strip(url)
    }

    fn build_instance(
        &self,
        live: &BTreeMap<String, ManagedInstance>,
        item: &DesiredItem,
    ) -> ManagedInstance {
        let (token, slug) = self.allocate_names(live, &item.id);
        let url = self.settings.correlation.tag(&item.url, &token);
        let scratch_dir = self
            .settings
            .data_dir
            .as_ref()
            .map(|root| root.join(sanitize(&self.settings.viewport)).join(&slug));

        let spec = InstanceSpec {
            id: item.id.clone(),
            slug,
            token,
            url,
            geometry: item.geometry,
            scratch_dir,
        };
        ManagedInstance::new(spec, self.runtime.clone())
    }

    /// Token and slug for a new instance, unique among live instances.
    ///
    /// A relabelled instance keeps the names of the id it was created under,
    /// so a later create for that id gets a numeric suffix.
    fn allocate_names(&self, live: &BTreeMap<String, ManagedInstance>, id: &str) -> (String, String) {
        let token = correlation_token(&self.settings.pool_type, &self.settings.viewport, id);
        let slug = sanitize(&format!("{}_{}", self.settings.viewport, id));

        let taken = |token: &str, slug: &str| {
            live.values()
                .any(|i| i.token() == token || i.slug() == slug)
        };

        if !taken(&token, &slug) {
            return (token, slug);
        }

        let mut n = 2u32;
        loop {
            let candidate = (format!("{token}__{n}"), format!("{slug}_{n}"));
            if !taken(&candidate.0, &candidate.1) {
                debug!(
                    viewport = %self.settings.viewport,
                    instance_id = %id,
                    token = %candidate.0,
                    "Correlation token in use, suffixed"
                );
                return candidate;
            }
            n += 1;
        }
    }

    async fn update_instance(
        &self,
        instance: &mut ManagedInstance,
        item: &DesiredItem,
        report: &mut ReconcileReport,
    ) {
        let viewport = self.settings.viewport.as_str();
        let id = item.id.as_str();

        if self.normalize(&item.url) != self.normalize(instance.url()) {
            // A relabelled instance keeps the token it was created with.
            let url = self.settings.correlation.tag(&item.url, instance.token());
            info!(
                viewport = %viewport,
                instance_id = %id,
                token = %instance.token(),
                from = %instance.url(),
                to = %url,
                "Updating instance url"
            );
            match instance.update_url(url).await {
                Ok(()) => report.navigated.push(id.to_string()),
                Err(e @ InstanceError::Lost { .. }) => {
                    error!(viewport = %viewport, instance_id = %id, error = %e, "Instance lost during url update");
                    report.fail(id, PoolAction::UpdateUrl, &e);
                    return;
                }
                Err(e) => {
                    error!(viewport = %viewport, instance_id = %id, error = %e, "Could not update url");
                    report.fail(id, PoolAction::UpdateUrl, &e);
                }
            }
        } else {
            debug!(viewport = %viewport, instance_id = %id, "Url unchanged");
        }

        let from = instance.geometry();
        match instance.update_geometry(item.geometry).await {
            Ok(()) => {
                debug!(viewport = %viewport, instance_id = %id, from = %from, to = %item.geometry, "Geometry applied")
            }
            Err(e) => {
                error!(viewport = %viewport, instance_id = %id, error = %e, "Could not update geometry");
                report.fail(id, PoolAction::UpdateGeometry, &e);
            }
        }

        if instance.status() == InstanceStatus::Hidden {
            if let Err(e) = instance.set_visibility(Visibility::Visible).await {
                warn!(viewport = %viewport, instance_id = %id, error = %e, "Could not show instance");
                report.fail(id, PoolAction::Show, &e);
            }
        }
    }
}

/// Keep slugs safe to use as a single path component.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Geometry;
    use crate::runtime::MockRuntime;

    fn test_pool(mock: &Arc<MockRuntime>) -> PoolReconciler {
        PoolReconciler::new(
            PoolSettings::new("adhoc", "center"),
            ProcessRuntime::mock(mock.clone()),
        )
    }

    fn item(id: &str, url: &str) -> DesiredItem {
        DesiredItem::new(id, url, Geometry::new(0, 0, 100, 100))
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("center_a/../b c"), "center_a_.._b_c");
    }

    #[tokio::test]
    async fn test_create_injects_token() {
        let mock = Arc::new(MockRuntime::new());
        let pool = test_pool(&mock);

        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![item("a", "http://x")]))
            .await;
        assert_eq!(report.created, vec!["a"]);
        assert_eq!(report.generation, 1);

        let state = pool.describe_state().await;
        let a = state.get("a").unwrap();
        assert_eq!(a.url, "http://x?ros_instance_name=adhoc__center__a");
        assert_eq!(a.status, InstanceStatus::Visible);
        assert_eq!(a.slug, "center_a");
    }

    #[tokio::test]
    async fn test_reused_id_after_relabel_gets_unique_names() {
        let mock = Arc::new(MockRuntime::new());
        let pool = test_pool(&mock);

        pool.reconcile(&DesiredSnapshot::new(vec![item("a", "http://x")]))
            .await;
        // "a" continues as "b"; then "a" comes back with another URL.
        pool.reconcile(&DesiredSnapshot::new(vec![item("b", "http://x")]))
            .await;
        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![
                item("b", "http://x"),
                item("a", "http://y"),
            ]))
            .await;
        assert_eq!(report.created, vec!["a"]);

        let state = pool.describe_state().await;
        let a = state.get("a").unwrap();
        let b = state.get("b").unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.slug, b.slug);
        assert_eq!(a.token, "adhoc__center__a__2");
    }

    #[tokio::test]
    async fn test_start_failure_is_not_tracked() {
        let mock = Arc::new(MockRuntime::new());
        mock.fail_spawn_for("center_b");
        let pool = test_pool(&mock);

        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![
                item("a", "http://x"),
                item("b", "http://y"),
            ]))
            .await;
        assert_eq!(report.created, vec!["a"]);
        assert!(report.failed("b"));
        assert_eq!(report.failures[0].action, PoolAction::Create);
        assert_eq!(pool.describe_state().await.ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_relaunch_restarts_everything() {
        let mock = Arc::new(MockRuntime::new());
        let pool = test_pool(&mock);
        pool.reconcile(&DesiredSnapshot::new(vec![
            item("a", "http://x"),
            item("b", "http://y"),
        ]))
        .await;
        mock.clear_calls();

        let report = pool.relaunch().await;
        assert_eq!(report.relaunched, vec!["a", "b"]);
        assert_eq!(mock.terminate_count(), 2);
        assert_eq!(mock.spawn_count(), 2);
        assert_eq!(mock.running_count(), 2);

        let state = pool.describe_state().await;
        assert_eq!(state.ids(), vec!["a", "b"]);
        assert!(state
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Visible));
    }

    #[tokio::test]
    async fn test_scratch_dirs_follow_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockRuntime::new());
        let pool = PoolReconciler::new(
            PoolSettings::new("adhoc", "center").with_data_dir(tmp.path()),
            ProcessRuntime::mock(mock),
        );

        pool.reconcile(&DesiredSnapshot::new(vec![item("a", "http://x")]))
            .await;
        let dir = tmp.path().join("center").join("center_a");
        assert!(dir.is_dir());

        pool.teardown().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_lost_process_is_dropped_and_recreated() {
        let mock = Arc::new(MockRuntime::new());
        let pool = test_pool(&mock);
        pool.reconcile(&DesiredSnapshot::new(vec![item("a", "http://x")]))
            .await;

        mock.lose_on_navigate_for("center_a");
        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![item("a", "http://y")]))
            .await;
        assert!(report.failed("a"));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].action, PoolAction::UpdateUrl);
        assert_eq!(pool.instance_count().await, 0);
        assert_eq!(mock.running_count(), 0);

        mock.clear_failures();
        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![item("a", "http://y")]))
            .await;
        assert_eq!(report.created, vec!["a"]);
        let state = pool.describe_state().await;
        assert_eq!(
            state.get("a").unwrap().url,
            "http://y?ros_instance_name=adhoc__center__a"
        );
        assert_eq!(mock.running_count(), 1);
    }

    #[tokio::test]
    async fn test_relabelled_instance_keeps_original_token_on_navigation() {
        let mock = Arc::new(MockRuntime::new());
        let pool = test_pool(&mock);
        pool.reconcile(&DesiredSnapshot::new(vec![item("a", "http://x")]))
            .await;
        pool.reconcile(&DesiredSnapshot::new(vec![item("b", "http://x")]))
            .await;

        let report = pool
            .reconcile(&DesiredSnapshot::new(vec![item("b", "http://y")]))
            .await;
        assert_eq!(report.navigated, vec!["b"]);

        let state = pool.describe_state().await;
        let b = state.get("b").unwrap();
        assert_eq!(b.token, "adhoc__center__a");
        assert_eq!(b.url, "http://y?ros_instance_name=adhoc__center__a");
    }

    #[tokio::test]
    async fn test_show_failure_keeps_instance_hidden() {
        let mock = Arc::new(MockRuntime::new());
        mock.fail_geometry_for("center_a");
        let pool = test_pool(&mock);

        let snapshot = DesiredSnapshot::new(vec![item("a", "http://x")]);
        let report = pool.reconcile(&snapshot).await;
        assert_eq!(report.created, vec!["a"]);
        assert!(report
            .failures
            .iter()
            .any(|f| f.action == PoolAction::Show));

        let state = pool.describe_state().await;
        assert_eq!(state.get("a").unwrap().status, InstanceStatus::Hidden);
    }
}
