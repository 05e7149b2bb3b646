//! Process runtime interfaces and implementations.
//!
//! The runtime abstracts the two collaborators a pool drives:
//! - A process supervisor that spawns, re-points, and terminates children
//! - A geometry applier that places and shows/hides their windows
//!
//! A mock implementation of both is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::model::Geometry;

/// Handle to a running child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Launch ID (unique per spawn, stable across navigation).
    pub launch_id: String,

    /// Slug the process was launched under.
    pub slug: String,

    /// OS process id, when the supervisor knows it.
    pub pid: Option<u32>,
}

/// Everything a supervisor needs to launch one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Stable, human-readable name (`{viewport}_{id}`).
    pub slug: String,

    /// URL with the correlation token already injected.
    pub url: String,

    pub geometry: Geometry,

    /// Instance-local scratch directory (browser profile, downloaded assets).
    pub scratch_dir: Option<PathBuf>,
}

/// Navigation left no process behind the handle.
///
/// Returned (inside the `anyhow` chain) by [`ProcessSupervisor::navigate`]
/// when the old child is gone and no new one could be launched.
#[derive(Debug, Error)]
#[error("process {slug} is gone: {reason}")]
pub struct ProcessLost {
    pub slug: String,
    pub reason: String,
}

/// Starts, re-points, and stops child processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Launch a child for the given spec.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;

    /// Point a running child at a new URL.
    ///
    /// Returns the handle now backing the instance (its pid may change).
    /// Fails with [`ProcessLost`] when no process is left running.
    async fn navigate(&self, handle: &ProcessHandle, url: &str) -> Result<ProcessHandle>;

    /// Stop a running child and wait for it to exit.
    async fn terminate(&self, handle: &ProcessHandle) -> Result<()>;
}

/// Places windows belonging to running children.
#[async_trait]
pub trait GeometryApplier: Send + Sync {
    /// Move/resize the window. Applying the current geometry again is a no-op.
    async fn apply_geometry(&self, handle: &ProcessHandle, geometry: &Geometry) -> Result<()>;

    /// Show or hide the window.
    async fn set_visible(&self, handle: &ProcessHandle, visible: bool) -> Result<()>;
}

/// The collaborators an instance drives, shared by every instance in a pool.
#[derive(Clone)]
pub struct ProcessRuntime {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub geometry: Arc<dyn GeometryApplier>,
}

impl ProcessRuntime {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, geometry: Arc<dyn GeometryApplier>) -> Self {
        Self {
            supervisor,
            geometry,
        }
    }

    /// Use one mock for both collaborators.
    pub fn mock(mock: Arc<MockRuntime>) -> Self {
        Self {
            supervisor: mock.clone(),
            geometry: mock,
        }
    }
}

/// A call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Spawn {
        slug: String,
        url: String,
        geometry: Geometry,
    },
    Navigate {
        slug: String,
        url: String,
    },
    Terminate {
        slug: String,
    },
    ApplyGeometry {
        slug: String,
        geometry: Geometry,
    },
    SetVisible {
        slug: String,
        visible: bool,
    },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    running: HashSet<String>,
    fail_spawn: HashSet<String>,
    fail_navigate: HashSet<String>,
    lose_on_navigate: HashSet<String>,
    fail_terminate: HashSet<String>,
    fail_geometry: HashSet<String>,
}

/// Mock runtime for testing and development.
///
/// Records every call and can be told to fail individual operations per slug.
#[derive(Debug)]
pub struct MockRuntime {
    /// Counter for generating launch IDs.
    launch_counter: AtomicU64,

    /// Whether every spawn should fail.
    fail_spawns: bool,

    /// Yield to the scheduler before every call.
    yield_calls: bool,

    state: Mutex<MockState>,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            launch_counter: AtomicU64::new(0),
            fail_spawns: false,
            yield_calls: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Create a mock runtime that fails all spawns.
    pub fn failing() -> Self {
        Self {
            fail_spawns: true,
            ..Self::new()
        }
    }

    /// Create a mock runtime whose calls suspend once, like real I/O.
    pub fn yielding() -> Self {
        Self {
            yield_calls: true,
            ..Self::new()
        }
    }

    pub fn fail_spawn_for(&self, slug: &str) {
        self.state().fail_spawn.insert(slug.to_string());
    }

    pub fn fail_navigate_for(&self, slug: &str) {
        self.state().fail_navigate.insert(slug.to_string());
    }

    /// Navigation of `slug` kills the process without replacing it.
    pub fn lose_on_navigate_for(&self, slug: &str) {
        self.state().lose_on_navigate.insert(slug.to_string());
    }

    pub fn fail_terminate_for(&self, slug: &str) {
        self.state().fail_terminate.insert(slug.to_string());
    }

    pub fn fail_geometry_for(&self, slug: &str) {
        self.state().fail_geometry.insert(slug.to_string());
    }

    /// Forget every per-slug failure.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_spawn.clear();
        state.fail_navigate.clear();
        state.lose_on_navigate.clear();
        state.fail_terminate.clear();
        state.fail_geometry.clear();
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    /// Forget recorded calls (failure settings are kept).
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn spawn_count(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Spawn { .. }))
    }

    pub fn terminate_count(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Terminate { .. }))
    }

    pub fn navigate_count(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Navigate { .. }))
    }

    /// Number of children spawned and not yet terminated.
    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if self.yield_calls {
            tokio::task::yield_now().await;
        }
    }

    /// Generate a new launch ID.
    fn next_launch_id(&self) -> String {
        let counter = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        format!("launch_{:016x}", counter)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for MockRuntime {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        self.pause().await;
        {
            let mut state = self.state();
            state.calls.push(RuntimeCall::Spawn {
                slug: spec.slug.clone(),
                url: spec.url.clone(),
                geometry: spec.geometry,
            });
            if self.fail_spawns || state.fail_spawn.contains(&spec.slug) {
                anyhow::bail!("Mock runtime configured to fail spawn of {}", spec.slug);
            }
        }

        let launch_id = self.next_launch_id();
        info!(slug = %spec.slug, url = %spec.url, launch_id = %launch_id, "[MOCK] Spawning process");
        self.state().running.insert(launch_id.clone());

        Ok(ProcessHandle {
            launch_id,
            slug: spec.slug.clone(),
            pid: None,
        })
    }

    async fn navigate(&self, handle: &ProcessHandle, url: &str) -> Result<ProcessHandle> {
        self.pause().await;
        let mut state = self.state();
        state.calls.push(RuntimeCall::Navigate {
            slug: handle.slug.clone(),
            url: url.to_string(),
        });
        if state.lose_on_navigate.contains(&handle.slug) {
            state.running.remove(&handle.launch_id);
            return Err(ProcessLost {
                slug: handle.slug.clone(),
                reason: "mock runtime configured to lose it on navigation".to_string(),
            }
            .into());
        }
        if state.fail_navigate.contains(&handle.slug) {
            anyhow::bail!("Mock runtime configured to fail navigation of {}", handle.slug);
        }
        debug!(slug = %handle.slug, url = %url, "[MOCK] Navigating");
        Ok(handle.clone())
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        self.pause().await;
        let mut state = self.state();
        state.calls.push(RuntimeCall::Terminate {
            slug: handle.slug.clone(),
        });
        if state.fail_terminate.contains(&handle.slug) {
            anyhow::bail!("Mock runtime configured to fail termination of {}", handle.slug);
        }
        state.running.remove(&handle.launch_id);
        info!(slug = %handle.slug, launch_id = %handle.launch_id, "[MOCK] Process terminated");
        Ok(())
    }
}

#[async_trait]
impl GeometryApplier for MockRuntime {
    async fn apply_geometry(&self, handle: &ProcessHandle, geometry: &Geometry) -> Result<()> {
        self.pause().await;
        let mut state = self.state();
        state.calls.push(RuntimeCall::ApplyGeometry {
            slug: handle.slug.clone(),
            geometry: *geometry,
        });
        if state.fail_geometry.contains(&handle.slug) {
            anyhow::bail!("Mock runtime configured to reject geometry for {}", handle.slug);
        }
        Ok(())
    }

    async fn set_visible(&self, handle: &ProcessHandle, visible: bool) -> Result<()> {
        self.pause().await;
        self.state().calls.push(RuntimeCall::SetVisible {
            slug: handle.slug.clone(),
            visible,
        });
        Ok(())
    }
}

struct ChildEntry {
    spec: LaunchSpec,
    child: Child,
}

/// Supervisor that launches children from a command-line template.
///
/// Placeholders `{url}`, `{slug}`, `{scratch_dir}`, `{x}`, `{y}`, `{width}`
/// and `{height}` are substituted per argument. The template has no remote
/// control channel, so navigation relaunches the child under the same handle.
pub struct CommandSupervisor {
    template: Vec<String>,
    stop_timeout: Duration,
    children: tokio::sync::Mutex<HashMap<String, ChildEntry>>,
    launch_counter: AtomicU64,
}

impl CommandSupervisor {
    pub fn new(template: &str, stop_timeout: Duration) -> Result<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            anyhow::bail!("Launch command template is empty");
        }
        Ok(Self {
            template,
            stop_timeout,
            children: tokio::sync::Mutex::new(HashMap::new()),
            launch_counter: AtomicU64::new(0),
        })
    }

    /// Render the argument vector for a spec.
    pub fn render(&self, spec: &LaunchSpec) -> Vec<String> {
        let scratch_dir = spec
            .scratch_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        self.template
            .iter()
            .map(|arg| {
                arg.replace("{url}", &spec.url)
                    .replace("{slug}", &spec.slug)
                    .replace("{scratch_dir}", &scratch_dir)
                    .replace("{x}", &spec.geometry.x.to_string())
                    .replace("{y}", &spec.geometry.y.to_string())
                    .replace("{width}", &spec.geometry.width.to_string())
                    .replace("{height}", &spec.geometry.height.to_string())
            })
            .collect()
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Child> {
        let argv = self.render(spec);
        let (program, args) = argv
            .split_first()
            .context("Launch command template is empty")?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {program} for {}", spec.slug))
    }

    async fn reap(&self, slug: &str, mut child: Child) -> Result<()> {
        if let Err(e) = child.start_kill() {
            // Already exited.
            debug!(slug = %slug, error = %e, "Child not killable");
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(slug = %slug, status = %status, "Child exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to wait for {slug}")),
            Err(_) => anyhow::bail!(
                "Child {slug} did not exit within {}ms",
                self.stop_timeout.as_millis()
            ),
        }
    }
}

#[async_trait]
impl ProcessSupervisor for CommandSupervisor {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let child = self.launch(spec)?;
        let pid = child.id();
        let counter = self.launch_counter.fetch_add(1, Ordering::SeqCst);
        let launch_id = format!("launch_{:016x}", counter);

        info!(slug = %spec.slug, pid = ?pid, launch_id = %launch_id, "Spawned process");

        self.children.lock().await.insert(
            launch_id.clone(),
            ChildEntry {
                spec: spec.clone(),
                child,
            },
        );

        Ok(ProcessHandle {
            launch_id,
            slug: spec.slug.clone(),
            pid,
        })
    }

    async fn navigate(&self, handle: &ProcessHandle, url: &str) -> Result<ProcessHandle> {
        let lost = |reason: String| ProcessLost {
            slug: handle.slug.clone(),
            reason,
        };

        let entry = self
            .children
            .lock()
            .await
            .remove(&handle.launch_id)
            .ok_or_else(|| lost("no child tracked".to_string()))?;

        let mut spec = entry.spec;
        spec.url = url.to_string();

        if let Err(e) = self.reap(&handle.slug, entry.child).await {
            warn!(slug = %handle.slug, error = %e, "Previous child did not stop cleanly");
        }

        // The old child is gone either way; a failed launch leaves nothing tracked.
        let child = self.launch(&spec).map_err(|e| lost(format!("{e:#}")))?;
        let pid = child.id();
        info!(slug = %handle.slug, pid = ?pid, url = %url, "Relaunched process at new URL");
        self.children
            .lock()
            .await
            .insert(handle.launch_id.clone(), ChildEntry { spec, child });

        Ok(ProcessHandle {
            launch_id: handle.launch_id.clone(),
            slug: handle.slug.clone(),
            pid,
        })
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        let entry = self.children.lock().await.remove(&handle.launch_id);
        match entry {
            Some(entry) => self.reap(&handle.slug, entry.child).await,
            None => {
                debug!(slug = %handle.slug, "No child tracked, nothing to terminate");
                Ok(())
            }
        }
    }
}

/// Geometry applier for hosts where placement is baked into the launch command.
#[derive(Debug, Default)]
pub struct NoopGeometryApplier;

#[async_trait]
impl GeometryApplier for NoopGeometryApplier {
    async fn apply_geometry(&self, handle: &ProcessHandle, geometry: &Geometry) -> Result<()> {
        debug!(slug = %handle.slug, geometry = %geometry, "Geometry recorded");
        Ok(())
    }

    async fn set_visible(&self, handle: &ProcessHandle, visible: bool) -> Result<()> {
        debug!(slug = %handle.slug, visible, "Visibility recorded");
        Ok(())
    }
}
