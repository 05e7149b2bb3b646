//! Managed instances: one external process per logical pool member.
//!
//! An instance owns its process handle and its scratch directory and knows
//! how to start, re-point, move, show/hide, and stop itself. It holds no
//! reconciliation logic; the pool decides when each operation runs and
//! serializes them under its lock.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Geometry;
use crate::runtime::{LaunchSpec, ProcessHandle, ProcessLost, ProcessRuntime};

/// Lifecycle status of a managed instance.
///
/// `Created -> Hidden | Visible`, `Visible <-> Updating`, `Hidden <-> Visible`,
/// and `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Hidden,
    Visible,
    Updating,
    Stopped,
}

impl InstanceStatus {
    /// Returns true if a process is running for this instance.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Hidden | Self::Visible | Self::Updating)
    }
}

/// Requested window visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Instance operation errors.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Operation on a stopped instance.
    #[error("instance {0} is stopped")]
    Stopped(String),

    /// Operation that needs a running process before start.
    #[error("instance {0} has not been started")]
    NotStarted(String),

    /// Start called twice.
    #[error("instance {0} is already started")]
    AlreadyStarted(String),

    #[error("failed to start instance {id}: {reason}")]
    Start { id: String, reason: String },

    #[error("failed to update url of instance {id}: {reason}")]
    Navigate { id: String, reason: String },

    #[error("failed to update geometry of instance {id}: {reason}")]
    Geometry { id: String, reason: String },

    #[error("failed to change visibility of instance {id}: {reason}")]
    Visibility { id: String, reason: String },

    /// The process died while being re-pointed; the instance is now stopped.
    #[error("instance {id} lost its process: {reason}")]
    Lost { id: String, reason: String },

    #[error("failed to stop instance {id}: {reason}")]
    Stop { id: String, reason: String },
}

/// Everything needed to construct an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Logical id inside the pool.
    pub id: String,

    /// Launch name, fixed for the life of the process.
    pub slug: String,

    /// Correlation token injected into `url`.
    pub token: String,

    /// URL with the correlation token injected.
    pub url: String,

    pub geometry: Geometry,

    pub scratch_dir: Option<PathBuf>,
}

/// Serializable view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDescription {
    pub id: String,
    pub slug: String,
    pub url: String,
    pub token: String,
    pub geometry: Geometry,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Handle to one externally running process.
pub struct ManagedInstance {
    spec: InstanceSpec,
    status: InstanceStatus,
    handle: Option<ProcessHandle>,
    started_at: Option<DateTime<Utc>>,
    runtime: ProcessRuntime,
}

impl std::fmt::Debug for ManagedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("spec", &self.spec)
            .field("status", &self.status)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ManagedInstance {
    pub fn new(spec: InstanceSpec, runtime: ProcessRuntime) -> Self {
        Self {
            spec,
            status: InstanceStatus::Created,
            handle: None,
            started_at: None,
            runtime,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn slug(&self) -> &str {
        &self.spec.slug
    }

    pub fn token(&self) -> &str {
        &self.spec.token
    }

    pub fn url(&self) -> &str {
        &self.spec.url
    }

    pub fn geometry(&self) -> Geometry {
        self.spec.geometry
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Launch the process. The window starts hidden.
    pub async fn start(&mut self) -> Result<(), InstanceError> {
        match self.status {
            InstanceStatus::Created => {}
            InstanceStatus::Stopped => return Err(InstanceError::Stopped(self.spec.id.clone())),
            _ => return Err(InstanceError::AlreadyStarted(self.spec.id.clone())),
        }

        if let Some(dir) = &self.spec.scratch_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                self.status = InstanceStatus::Stopped;
                return Err(InstanceError::Start {
                    id: self.spec.id.clone(),
                    reason: format!("failed to create {}: {e}", dir.display()),
                });
            }
        }

        let launch = LaunchSpec {
            slug: self.spec.slug.clone(),
            url: self.spec.url.clone(),
            geometry: self.spec.geometry,
            scratch_dir: self.spec.scratch_dir.clone(),
        };

        match self.runtime.supervisor.spawn(&launch).await {
            Ok(handle) => {
                info!(
                    instance_id = %self.spec.id,
                    slug = %self.spec.slug,
                    launch_id = %handle.launch_id,
                    "Instance started"
                );
                self.handle = Some(handle);
                self.started_at = Some(Utc::now());
                self.status = InstanceStatus::Hidden;
                Ok(())
            }
            Err(e) => {
                self.status = InstanceStatus::Stopped;
                self.remove_scratch_dir().await;
                Err(InstanceError::Start {
                    id: self.spec.id.clone(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Show or hide the window. Showing applies the current geometry first.
    pub async fn set_visibility(&mut self, visibility: Visibility) -> Result<(), InstanceError> {
        let handle = self.running_handle()?.clone();
        let visible = visibility == Visibility::Visible;

        if visible {
            self.runtime
                .geometry
                .apply_geometry(&handle, &self.spec.geometry)
                .await
                .map_err(|e| InstanceError::Visibility {
                    id: self.spec.id.clone(),
                    reason: format!("{e:#}"),
                })?;
        }

        self.runtime
            .geometry
            .set_visible(&handle, visible)
            .await
            .map_err(|e| InstanceError::Visibility {
                id: self.spec.id.clone(),
                reason: format!("{e:#}"),
            })?;

        self.status = if visible {
            InstanceStatus::Visible
        } else {
            InstanceStatus::Hidden
        };
        Ok(())
    }

    /// Re-point the running process at `url` (already carrying the token).
    ///
    /// On failure the previous URL is kept. If the supervisor reports the
    /// process lost, the instance becomes `Stopped` and releases its scratch
    /// directory.
    pub async fn update_url(&mut self, url: String) -> Result<(), InstanceError> {
        let handle = self.running_handle()?.clone();
        let resume = self.status;
        self.status = InstanceStatus::Updating;

        let result = self.runtime.supervisor.navigate(&handle, &url).await;
        self.status = resume;

        match result {
            Ok(handle) => {
                debug!(instance_id = %self.spec.id, from = %self.spec.url, to = %url, pid = ?handle.pid, "Instance url updated");
                self.handle = Some(handle);
                self.spec.url = url;
                Ok(())
            }
            Err(e) if e.downcast_ref::<ProcessLost>().is_some() => {
                warn!(instance_id = %self.spec.id, slug = %self.spec.slug, error = %e, "Instance lost its process");
                self.handle = None;
                self.status = InstanceStatus::Stopped;
                self.remove_scratch_dir().await;
                Err(InstanceError::Lost {
                    id: self.spec.id.clone(),
                    reason: format!("{e:#}"),
                })
            }
            Err(e) => Err(InstanceError::Navigate {
                id: self.spec.id.clone(),
                reason: format!("{e:#}"),
            }),
        }
    }

    /// Move/resize the window.
    ///
    /// On failure the previous geometry is kept.
    pub async fn update_geometry(&mut self, geometry: Geometry) -> Result<(), InstanceError> {
        let handle = self.running_handle()?.clone();
        let resume = self.status;
        self.status = InstanceStatus::Updating;

        let result = self
            .runtime
            .geometry
            .apply_geometry(&handle, &geometry)
            .await;
        self.status = resume;

        match result {
            Ok(()) => {
                self.spec.geometry = geometry;
                Ok(())
            }
            Err(e) => Err(InstanceError::Geometry {
                id: self.spec.id.clone(),
                reason: format!("{e:#}"),
            }),
        }
    }

    /// Change the logical id. The process, slug, and token are kept.
    pub fn relabel(&mut self, id: impl Into<String>) {
        self.spec.id = id.into();
    }

    /// Terminate the process and release the scratch directory.
    ///
    /// Calling stop on a stopped instance does nothing. Local resources are
    /// released even when termination fails.
    pub async fn stop(&mut self) -> Result<(), InstanceError> {
        if self.status == InstanceStatus::Stopped {
            debug!(instance_id = %self.spec.id, "Instance already stopped");
            return Ok(());
        }

        let result = match self.handle.take() {
            Some(handle) => self.runtime.supervisor.terminate(&handle).await,
            None => Ok(()),
        };

        self.remove_scratch_dir().await;
        self.status = InstanceStatus::Stopped;

        match result {
            Ok(()) => {
                info!(instance_id = %self.spec.id, slug = %self.spec.slug, "Instance stopped");
                Ok(())
            }
            Err(e) => Err(InstanceError::Stop {
                id: self.spec.id.clone(),
                reason: format!("{e:#}"),
            }),
        }
    }

    pub fn describe(&self) -> InstanceDescription {
        InstanceDescription {
            id: self.spec.id.clone(),
            slug: self.spec.slug.clone(),
            url: self.spec.url.clone(),
            token: self.spec.token.clone(),
            geometry: self.spec.geometry,
            status: self.status,
            pid: self.handle.as_ref().and_then(|h| h.pid),
            launch_id: self.handle.as_ref().map(|h| h.launch_id.clone()),
            started_at: self.started_at,
        }
    }

    fn running_handle(&self) -> Result<&ProcessHandle, InstanceError> {
        match (self.status, self.handle.as_ref()) {
            (InstanceStatus::Stopped, _) => Err(InstanceError::Stopped(self.spec.id.clone())),
            (status, Some(handle)) if status.is_running() => Ok(handle),
            _ => Err(InstanceError::NotStarted(self.spec.id.clone())),
        }
    }

    async fn remove_scratch_dir(&self) {
        let Some(dir) = &self.spec.scratch_dir else {
            return;
        };

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(instance_id = %self.spec.id, dir = %dir.display(), "Scratch directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                instance_id = %self.spec.id,
                dir = %dir.display(),
                error = %e,
                "Failed to remove scratch directory"
            ),
        }
    }
}
