//! Reconciliation planning by URL identity.

use std::collections::{BTreeMap, HashSet, VecDeque};

/// The matching key for one instance: its id and its normalized URL.
///
/// `url` must already have the correlation parameter stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKey {
    pub id: String,
    pub url: String,
}

impl MatchKey {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// A live instance that continues under a new id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relabel {
    pub from: String,
    pub to: String,
}

/// Actions that converge the current pool onto a desired snapshot.
///
/// Apply in field order: `remove`, `relabel`, `create`, then `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Live ids to stop, sorted.
    pub remove: Vec<String>,

    /// Live ids kept running under a new desired id.
    pub relabel: Vec<Relabel>,

    /// Desired ids with no live counterpart, in snapshot order.
    pub create: Vec<String>,

    /// Desired ids backed by a kept instance (same id or relabelled), in
    /// snapshot order.
    pub update: Vec<String>,
}

impl ReconcilePlan {
    /// Returns true if the plan starts or stops nothing.
    pub fn is_steady(&self) -> bool {
        self.remove.is_empty() && self.relabel.is_empty() && self.create.is_empty()
    }
}

/// Plan the actions that turn `current` into `desired`.
///
/// A desired id that is already live is kept. A desired id that is not live
/// continues a live instance with the same normalized URL, provided that
/// instance is not itself desired; candidates are consumed in id order so each
/// live instance is claimed at most once. Everything else is created, and live
/// instances left unclaimed are removed.
///
/// Desired ids are expected to be unique; a repeated id is ignored after its
/// first occurrence.
pub fn plan_actions(current: &[MatchKey], desired: &[MatchKey]) -> ReconcilePlan {
    let live: BTreeMap<&str, &str> = current
        .iter()
        .map(|k| (k.id.as_str(), k.url.as_str()))
        .collect();
    let desired_ids: HashSet<&str> = desired.iter().map(|k| k.id.as_str()).collect();

    // Live instances nobody asks for by id, grouped by URL identity.
    let mut candidates: BTreeMap<&str, VecDeque<&str>> = BTreeMap::new();
    for (&id, &url) in &live {
        if !desired_ids.contains(id) {
            candidates.entry(url).or_default().push_back(id);
        }
    }

    let mut plan = ReconcilePlan::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for key in desired {
        if !seen.insert(key.id.as_str()) {
            continue;
        }

        if live.contains_key(key.id.as_str()) {
            plan.update.push(key.id.clone());
            continue;
        }

        let continued = candidates
            .get_mut(key.url.as_str())
            .and_then(|ids| ids.pop_front());

        match continued {
            Some(from) => {
                plan.relabel.push(Relabel {
                    from: from.to_string(),
                    to: key.id.clone(),
                });
                plan.update.push(key.id.clone());
            }
            None => plan.create.push(key.id.clone()),
        }
    }

    let mut remove: Vec<String> = candidates
        .into_values()
        .flatten()
        .map(str::to_string)
        .collect();
    remove.sort();
    plan.remove = remove;

    plan
}
