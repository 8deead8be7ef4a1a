pub mod state;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::data_dir;
use crate::model::scope::TrackerScope;
pub use state::TrackerPersistedState;

/// Tracker id given to state migrated from a single-tracker document.
pub const LEGACY_TRACKER_ID: &str = "legacy";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tracker_id: Option<String>,
    #[serde(default)]
    pub trackers: BTreeMap<String, TrackerPersistedState>,
}

/// Parses a persisted document, accepting both the multi-tracker layout and
/// the older single-tracker one. Unreadable input yields an empty document.
pub fn parse_document(contents: &str) -> StateDocument {
    let value: Value = match serde_json::from_str(contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "state document is not valid JSON, starting empty");
            return StateDocument::default();
        }
    };
    let Value::Object(mut root) = value else {
        warn!("state document is not an object, starting empty");
        return StateDocument::default();
    };

    if let Some(trackers) = root.remove("trackers") {
        let trackers = match trackers {
            Value::Object(entries) => entries
                .into_iter()
                .filter_map(|(id, entry)| match serde_json::from_value(entry) {
                    Ok(state) => Some((id, state)),
                    Err(e) => {
                        warn!(tracker = %id, error = %e, "dropping unreadable tracker state");
                        None
                    }
                })
                .collect(),
            _ => BTreeMap::new(),
        };
        let active_tracker_id = root
            .get("activeTrackerId")
            .and_then(Value::as_str)
            .map(String::from);
        return StateDocument {
            active_tracker_id,
            trackers,
        };
    }

    const LEGACY_KEYS: &[&str] = &["scopeKey", "cursor", "seenChangeIds", "history"];
    if LEGACY_KEYS.iter().any(|k| root.contains_key(*k)) {
        info!("migrating single-tracker state document");
        if let Ok(state) = serde_json::from_value::<TrackerPersistedState>(Value::Object(root)) {
            return StateDocument {
                active_tracker_id: Some(LEGACY_TRACKER_ID.to_string()),
                trackers: BTreeMap::from([(LEGACY_TRACKER_ID.to_string(), state)]),
            };
        }
    }

    StateDocument::default()
}

/// Owns the persisted state of every tracker. Written wholesale.
pub struct StateStore {
    path: PathBuf,
    data: StateDocument,
}

impl StateStore {
    pub fn open_default() -> Result<Self> {
        Self::open(data_dir().join("state.json"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            parse_document(&contents)
        } else {
            StateDocument::default()
        };
        Ok(Self { path, data })
    }

    #[cfg(test)]
    pub fn document(&self) -> &StateDocument {
        &self.data
    }

    pub fn tracker(&self, id: &str) -> Option<&TrackerPersistedState> {
        self.data.trackers.get(id)
    }

    /// Mutable access to an existing tracker's state. Returns `None` for
    /// trackers removed since the poll started.
    pub fn tracker_mut(&mut self, id: &str) -> Option<&mut TrackerPersistedState> {
        self.data.trackers.get_mut(id)
    }

    pub fn set_active(&mut self, id: Option<String>) {
        self.data.active_tracker_id = id;
    }

    /// Moves migrated single-tracker state under `tracker_id` unless that
    /// tracker already has state of its own.
    pub fn adopt_legacy(&mut self, tracker_id: &str) {
        if tracker_id == LEGACY_TRACKER_ID || self.data.trackers.contains_key(tracker_id) {
            return;
        }
        if let Some(state) = self.data.trackers.remove(LEGACY_TRACKER_ID) {
            info!(tracker = tracker_id, "adopting migrated tracker state");
            self.data.trackers.insert(tracker_id.to_string(), state);
            if self.data.active_tracker_id.as_deref() == Some(LEGACY_TRACKER_ID) {
                self.data.active_tracker_id = Some(tracker_id.to_string());
            }
        }
    }

    /// Returns the tracker's state, replacing it with a clean one seeded at
    /// the sprint start when it is missing or belongs to another scope.
    /// The flag reports whether a reset happened.
    pub fn fence(&mut self, id: &str, scope: &TrackerScope) -> (&mut TrackerPersistedState, bool) {
        let valid = self
            .data
            .trackers
            .get(id)
            .is_some_and(|state| state.matches(scope));
        if !valid {
            if self.data.trackers.contains_key(id) {
                info!(tracker = id, scope = %scope.key(), "tracker scope changed, resetting state");
            }
            self.data
                .trackers
                .insert(id.to_string(), TrackerPersistedState::fresh(scope));
        }
        let state = self
            .data
            .trackers
            .entry(id.to_string())
            .or_insert_with(|| TrackerPersistedState::fresh(scope));
        (state, !valid)
    }

    pub fn remove(&mut self, id: &str) -> Option<TrackerPersistedState> {
        if self.data.active_tracker_id.as_deref() == Some(id) {
            self.data.active_tracker_id = None;
        }
        self.data.trackers.remove(id)
    }

    /// Drops state for trackers that are no longer configured.
    pub fn retain_trackers<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        let keep: Vec<&str> = ids.into_iter().collect();
        self.data.trackers.retain(|id, _| keep.contains(&id.as_str()));
    }

    /// Applies retention to every tracker and writes the whole document.
    pub fn persist(&mut self, now: DateTime<Utc>) -> Result<()> {
        for state in self.data.trackers.values_mut() {
            state.trim(now);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
