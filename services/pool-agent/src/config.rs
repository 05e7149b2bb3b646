//! Configuration for the pool agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use vpool_reconcile::DEFAULT_CORRELATION_PARAM;

/// Launch template used when none is configured.
pub const DEFAULT_BROWSER_COMMAND: &str = "chromium --no-first-run --user-data-dir={scratch_dir} \
     --window-position={x},{y} --window-size={width},{height} --app={url}";

/// Which process runtime drives the pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Spawn real children from the launch template.
    Command,

    /// Record calls only (development).
    Mock,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "command" => Ok(Self::Command),
            "mock" => Ok(Self::Mock),
            other => anyhow::bail!("unknown runtime {other:?} (expected command or mock)"),
        }
    }
}

/// Pool agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Viewports served by this agent, one pool each.
    pub viewports: Vec<String>,

    /// Pool type, first component of every correlation token.
    pub pool_type: String,

    /// Director window activity handled by the pools.
    pub activity: String,

    /// Query parameter carrying the correlation token.
    pub correlation_param: String,

    /// Root of per-instance scratch directories.
    pub data_dir: PathBuf,

    pub runtime: RuntimeKind,

    /// Launch command template for the command runtime.
    pub browser_command: String,

    /// Grace period for a child to exit after being killed.
    pub stop_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("VPOOL_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8095".to_string())
            .parse::<SocketAddr>()
            .context("VPOOL_LISTEN_ADDR must be a socket address.")?;

        let viewports: Vec<String> = lookup("VPOOL_VIEWPORTS")
            .unwrap_or_else(|| "center".to_string())
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if viewports.is_empty() {
            anyhow::bail!("VPOOL_VIEWPORTS must name at least one viewport.");
        }

        let pool_type = lookup("VPOOL_POOL_TYPE").unwrap_or_else(|| "adhoc".to_string());

        let activity = lookup("VPOOL_ACTIVITY").unwrap_or_else(|| "browser".to_string());

        let correlation_param = lookup("VPOOL_CORRELATION_PARAM")
            .unwrap_or_else(|| DEFAULT_CORRELATION_PARAM.to_string());

        let data_dir = lookup("VPOOL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/vpool"));

        let runtime = lookup("VPOOL_RUNTIME")
            .map(|v| v.parse::<RuntimeKind>())
            .transpose()
            .context("VPOOL_RUNTIME must be command or mock.")?
            .unwrap_or(RuntimeKind::Command);

        let browser_command =
            lookup("VPOOL_BROWSER_COMMAND").unwrap_or_else(|| DEFAULT_BROWSER_COMMAND.to_string());

        let stop_timeout_ms: u64 = lookup("VPOOL_STOP_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("VPOOL_STOP_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(3000);
        let stop_timeout = Duration::from_millis(stop_timeout_ms.max(100));

        let log_level = lookup("VPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            viewports,
            pool_type,
            activity,
            correlation_param,
            data_dir,
            runtime,
            browser_command,
            stop_timeout,
            log_level,
        })
    }
}
