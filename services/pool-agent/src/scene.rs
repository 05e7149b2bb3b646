//! Director scene decoding.
//!
//! A director scene is a whole-state JSON document listing every window the
//! display should show. The decoder keeps the windows of one activity, groups
//! them by viewport, and produces one [`DesiredSnapshot`] per viewport. A
//! malformed window rejects the whole scene so that no pool ever sees half of
//! it.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{DesiredItem, DesiredSnapshot, Geometry};

/// Scene decoding errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not valid scene JSON.
    #[error("invalid scene json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Window has no asset to show.
    #[error("window {index} has no assets")]
    MissingAsset { index: usize },

    /// Window lacks a required field.
    #[error("window {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct RawScene {
    #[serde(default)]
    windows: Vec<RawWindow>,
}

#[derive(Debug, Deserialize)]
struct RawWindow {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    activity: String,
    #[serde(default)]
    assets: Vec<String>,
    x_coord: Option<i32>,
    y_coord: Option<i32>,
    width: Option<u32>,
    height: Option<u32>,
    presentation_viewport: Option<String>,
}

/// Per-viewport snapshots decoded from one scene.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scene {
    snapshots: BTreeMap<String, DesiredSnapshot>,
}

impl Scene {
    /// Snapshot for `viewport`; empty when the scene shows nothing there.
    pub fn snapshot_for(&self, viewport: &str) -> DesiredSnapshot {
        self.snapshots.get(viewport).cloned().unwrap_or_default()
    }

    /// Viewports the scene places at least one window on.
    pub fn viewports(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }
}

/// Decodes director scenes for one activity.
#[derive(Debug, Clone)]
pub struct SceneDecoder {
    activity: String,
}

impl SceneDecoder {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
        }
    }

    pub fn decode(&self, raw: &str) -> Result<Scene, DecodeError> {
        let scene: RawScene = serde_json::from_str(raw)?;
        self.build(scene)
    }

    pub fn decode_value(&self, value: serde_json::Value) -> Result<Scene, DecodeError> {
        let scene: RawScene = serde_json::from_value(value)?;
        self.build(scene)
    }

    fn build(&self, scene: RawScene) -> Result<Scene, DecodeError> {
        let mut snapshots: BTreeMap<String, DesiredSnapshot> = BTreeMap::new();
        let mut seen: HashMap<(String, String), usize> = HashMap::new();

        for (index, window) in scene.windows.into_iter().enumerate() {
            if window.activity != self.activity {
                continue;
            }

            let url = window
                .assets
                .into_iter()
                .next()
                .ok_or(DecodeError::MissingAsset { index })?;
            let viewport = window
                .presentation_viewport
                .ok_or(DecodeError::MissingField {
                    index,
                    field: "presentation_viewport",
                })?;
            let geometry = Geometry::new(
                required(window.x_coord, index, "x_coord")?,
                required(window.y_coord, index, "y_coord")?,
                required(window.width, index, "width")?,
                required(window.height, index, "height")?,
            );

            let base_id = window
                .id
                .unwrap_or_else(|| derived_id(&self.activity, &url, &geometry));
            let repeats = seen.entry((viewport.clone(), base_id.clone())).or_insert(0);
            *repeats += 1;
            let id = if *repeats == 1 {
                base_id
            } else {
                format!("{base_id}-{repeats}")
            };

            snapshots
                .entry(viewport)
                .or_default()
                .items
                .push(DesiredItem::new(id, url, geometry));
        }

        Ok(Scene { snapshots })
    }
}

fn required<T>(value: Option<T>, index: usize, field: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField { index, field })
}

/// Deterministic id for a window without one, so re-sent scenes are steady.
fn derived_id(activity: &str, url: &str, geometry: &Geometry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(geometry.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("{activity}_{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(viewport: &str, url: &str, x: i32) -> serde_json::Value {
        serde_json::json!({
            "activity": "browser",
            "assets": [url],
            "x_coord": x,
            "y_coord": 0,
            "width": 640,
            "height": 480,
            "presentation_viewport": viewport,
        })
    }

    #[test]
    fn test_groups_windows_by_viewport() {
        let scene = serde_json::json!({
            "windows": [
                window("center", "http://x", 0),
                window("left", "http://y", 0),
                window("center", "http://z", 100),
            ]
        });

        let scene = SceneDecoder::new("browser").decode_value(scene).unwrap();
        assert_eq!(scene.snapshot_for("center").items.len(), 2);
        assert_eq!(scene.snapshot_for("left").items.len(), 1);
        assert!(scene.snapshot_for("right").is_empty());
        assert_eq!(scene.viewports().collect::<Vec<_>>(), vec!["center", "left"]);
    }

    #[test]
    fn test_skips_other_activities() {
        let mut image = window("center", "http://img", 0);
        image["activity"] = serde_json::json!("image");
        let scene = serde_json::json!({ "windows": [image] });

        let scene = SceneDecoder::new("browser").decode_value(scene).unwrap();
        assert!(scene.snapshot_for("center").is_empty());
    }

    #[test]
    fn test_derived_ids_are_stable() {
        let raw = serde_json::json!({ "windows": [window("center", "http://x", 0)] }).to_string();
        let decoder = SceneDecoder::new("browser");

        let first = decoder.decode(&raw).unwrap().snapshot_for("center");
        let second = decoder.decode(&raw).unwrap().snapshot_for("center");
        assert_eq!(first, second);
        assert!(first.items[0].id.starts_with("browser_"));
    }

    #[test]
    fn test_identical_windows_get_distinct_ids() {
        let scene = serde_json::json!({
            "windows": [window("center", "http://x", 0), window("center", "http://x", 0)]
        });

        let snapshot = SceneDecoder::new("browser")
            .decode_value(scene)
            .unwrap()
            .snapshot_for("center");
        assert_eq!(snapshot.items.len(), 2);
        assert_ne!(snapshot.items[0].id, snapshot.items[1].id);
        assert!(snapshot.items[1].id.ends_with("-2"));
    }

    #[test]
    fn test_explicit_id_is_used() {
        let mut w = window("center", "http://x", 0);
        w["id"] = serde_json::json!("news");
        let scene = serde_json::json!({ "windows": [w] });

        let snapshot = SceneDecoder::new("browser")
            .decode_value(scene)
            .unwrap()
            .snapshot_for("center");
        assert_eq!(snapshot.items[0].id, "news");
    }

    #[test]
    fn test_missing_asset_rejects_scene() {
        let mut w = window("center", "http://x", 0);
        w["assets"] = serde_json::json!([]);
        let scene = serde_json::json!({ "windows": [window("left", "http://y", 0), w] });

        let err = SceneDecoder::new("browser").decode_value(scene).unwrap_err();
        assert!(matches!(err, DecodeError::MissingAsset { index: 1 }));
    }

    #[test]
    fn test_missing_geometry_rejects_scene() {
        let mut w = window("center", "http://x", 0);
        w.as_object_mut().unwrap().remove("width");
        let scene = serde_json::json!({ "windows": [w] });

        let err = SceneDecoder::new("browser").decode_value(scene).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingField {
                index: 0,
                field: "width"
            }
        ));
    }

    #[test]
    fn test_invalid_json() {
        let err = SceneDecoder::new("browser").decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn test_empty_scene() {
        let scene = SceneDecoder::new("browser").decode("{}").unwrap();
        assert_eq!(scene.viewports().count(), 0);
    }
}
