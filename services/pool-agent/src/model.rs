//! Desired-state types delivered to a pool.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vpool_reconcile::StateHash;

/// Window placement for one instance, taken verbatim from upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// One instance the caller wants running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredItem {
    pub id: String,
    pub url: String,
    pub geometry: Geometry,
}

impl DesiredItem {
    pub fn new(id: impl Into<String>, url: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            geometry,
        }
    }
}

/// Complete target state for one viewport.
///
/// An empty snapshot means "stop everything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSnapshot {
    #[serde(default)]
    pub items: Vec<DesiredItem>,
}

impl DesiredSnapshot {
    pub fn new(items: Vec<DesiredItem>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Collapse repeated ids: the later item wins and takes the position of
    /// the first occurrence.
    pub fn deduplicated(&self) -> Vec<DesiredItem> {
        let mut out: Vec<DesiredItem> = Vec::with_capacity(self.items.len());
        let mut index: HashMap<&str, usize> = HashMap::new();

        for item in &self.items {
            match index.get(item.id.as_str()) {
                Some(&pos) => out[pos] = item.clone(),
                None => {
                    index.insert(item.id.as_str(), out.len());
                    out.push(item.clone());
                }
            }
        }

        out
    }

    /// Fingerprint of the snapshot content.
    pub fn state_hash(&self) -> StateHash {
        let value = serde_json::to_value(&self.items).unwrap_or(serde_json::Value::Null);
        StateHash::from_json(&value)
    }
}

impl From<Vec<DesiredItem>> for DesiredSnapshot {
    fn from(items: Vec<DesiredItem>) -> Self {
        Self::new(items)
    }
}
