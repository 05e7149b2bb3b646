//! Pool reconciliation primitives.
//!
//! This library holds the pure, synchronous half of pool convergence:
//!
//! - **Desired state**: the whole-state snapshot a viewport should show.
//! - **Current state**: the instances the pool is running right now.
//! - **Plan**: the remove / relabel / create / update sets that move the
//!   current state onto the desired state.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs
//! - Planning the desired state against itself yields no create/remove actions
//! - Instances are matched by URL identity, with the correlation parameter
//!   stripped, before falling back to a fresh create

mod correlation;
mod plan;

pub use correlation::{correlation_token, CorrelationParam, DEFAULT_CORRELATION_PARAM};
pub use plan::{plan_actions, MatchKey, ReconcilePlan, Relabel};

use sha2::{Digest, Sha256};

/// Fingerprint of a desired snapshot.
///
/// Hashes the compact JSON rendering. `serde_json` keeps object keys sorted,
/// so equal values hash equally whatever order their keys were built in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateHash(String);

impl StateHash {
    pub fn from_json(json: &serde_json::Value) -> Self {
        let digest = Sha256::digest(json.to_string().as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
