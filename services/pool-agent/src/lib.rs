//! vpool Pool Agent Library
//!
//! The pool agent keeps one pool of externally spawned browser windows per
//! viewport. Desired state arrives as whole-state snapshots (directly, or
//! decoded from a director scene) and each pool converges its live processes
//! onto the latest one without restarting windows that can be kept.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API (axum)
//! └── PoolRegistry
//!     └── PoolReconciler(viewport)   (one lock each)
//!         └── ManagedInstance(id)    (one external process each)
//!             └── ProcessRuntime     (supervisor + geometry applier)
//! ```
//!
//! ## Modules
//!
//! - `model`: desired-state types
//! - `scene`: director scene decoding
//! - `runtime`: process and window collaborators (command and mock)
//! - `instance`: single managed process and its state machine
//! - `pool`: per-viewport reconciler
//! - `registry`: viewport name to pool

pub mod api;
pub mod config;
pub mod instance;
pub mod model;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod scene;
pub mod state;

// Re-export commonly used types
pub use instance::{InstanceError, InstanceStatus, ManagedInstance};
pub use model::{DesiredItem, DesiredSnapshot, Geometry};
pub use pool::{PoolDescription, PoolReconciler, PoolSettings, ReconcileReport};
pub use registry::PoolRegistry;
pub use runtime::MockRuntime;
