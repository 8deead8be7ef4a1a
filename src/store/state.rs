use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::changes::sort_newest_first;
use crate::model::scope::TrackerScope;
use crate::model::story::{ClassifiedStory, StoryChange};

pub const RETENTION_DAYS: i64 = 45;
pub const SEEN_CAP: usize = 2000;
pub const OVERLAP_MINUTES: i64 = 15;

/// Everything persisted for one tracker. Each field falls back to its
/// default when missing or unreadable, and bad list entries are dropped
/// individually.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerPersistedState {
    #[serde(default, deserialize_with = "lenient")]
    pub scope_key: String,
    /// Exclusive start of the next feed window, before overlap is applied.
    #[serde(default, deserialize_with = "lenient")]
    pub cursor: Option<DateTime<Utc>>,
    /// Oldest first.
    #[serde(default, deserialize_with = "lenient_list")]
    pub seen_change_ids: Vec<String>,
    /// Newest first.
    #[serde(default, deserialize_with = "lenient_list")]
    pub history: Vec<StoryChange>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_notification_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub classified_stories: Vec<ClassifiedStory>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

impl TrackerPersistedState {
    /// Clean state for a scope, with the cursor at the sprint start.
    pub fn fresh(scope: &TrackerScope) -> Self {
        Self {
            scope_key: scope.key(),
            cursor: Some(scope.sprint_start),
            ..Self::default()
        }
    }

    pub fn matches(&self, scope: &TrackerScope) -> bool {
        self.scope_key == scope.key()
    }

    /// Inclusive lower bound for the next feed query: the cursor pulled back
    /// by the overlap window, never earlier than the sprint start.
    pub fn query_lower_bound(&self, scope: &TrackerScope) -> DateTime<Utc> {
        let cursor = self.cursor.unwrap_or(scope.sprint_start);
        (cursor - Duration::minutes(OVERLAP_MINUTES)).max(scope.sprint_start)
    }

    /// Merges changes into history and returns the ones not seen before.
    pub fn merge_changes(&mut self, incoming: &[StoryChange]) -> Vec<StoryChange> {
        let seen: HashSet<&str> = self.seen_change_ids.iter().map(String::as_str).collect();
        let mut fresh: Vec<StoryChange> = incoming
            .iter()
            .filter(|c| !seen.contains(c.change_id.as_str()))
            .cloned()
            .collect();
        sort_newest_first(&mut fresh);
        fresh.dedup_by(|a, b| a.change_id == b.change_id);

        self.history = merge(&self.history, incoming);

        let mut oldest_first: Vec<&StoryChange> = fresh.iter().collect();
        oldest_first.reverse();
        self.seen_change_ids
            .extend(oldest_first.into_iter().map(|c| c.change_id.clone()));
        cap_seen(&mut self.seen_change_ids);

        fresh
    }

    pub fn trim(&mut self, now: DateTime<Utc>) {
        self.history = trim_history(&self.history, now);
        cap_seen(&mut self.seen_change_ids);
    }
}

/// Union by change id, newest first. Identical ids carry identical content,
/// so which copy survives does not matter.
pub fn merge(history: &[StoryChange], incoming: &[StoryChange]) -> Vec<StoryChange> {
    let mut by_id = std::collections::HashMap::with_capacity(history.len() + incoming.len());
    for change in history.iter().chain(incoming) {
        by_id.insert(change.change_id.as_str(), change);
    }
    let mut merged: Vec<StoryChange> = by_id.into_values().cloned().collect();
    sort_newest_first(&mut merged);
    merged
}

pub fn trim_history(history: &[StoryChange], now: DateTime<Utc>) -> Vec<StoryChange> {
    let horizon = now - Duration::days(RETENTION_DAYS);
    history
        .iter()
        .filter(|c| c.changed_at >= horizon)
        .cloned()
        .collect()
}

/// Drops the oldest ids beyond [`SEEN_CAP`].
pub fn cap_seen(ids: &mut Vec<String>) {
    if ids.len() > SEEN_CAP {
        let excess = ids.len() - SEEN_CAP;
        ids.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, hour, 0, 0).unwrap()
    }

    fn change(id: &str, changed_at: DateTime<Utc>) -> StoryChange {
        StoryChange {
            change_id: id.into(),
            story_id: "1".into(),
            formatted_id: "US1".into(),
            title: "t".into(),
            owner: None,
            status: None,
            ready: None,
            schedule_state: None,
            project_name: "Web".into(),
            url: String::new(),
            changed_at,
            changed_fields: vec!["Name".into()],
            actor: None,
            schedule_state_from: None,
            schedule_state_to: None,
        }
    }

    fn scope() -> TrackerScope {
        TrackerScope::new("ws", vec!["p".into()], "it", at(0))
    }

    #[test]
    fn merge_with_nothing_is_identity() {
        let history = vec![change("b", at(2)), change("a", at(1))];
        assert_eq!(merge(&history, &[]), history);
    }

    #[test]
    fn merge_with_itself_is_identity_in_any_order() {
        let history = vec![change("b", at(2)), change("a", at(1))];
        let reversed: Vec<StoryChange> = history.iter().rev().cloned().collect();
        assert_eq!(merge(&history, &history), history);
        assert_eq!(merge(&reversed, &history), history);
        assert_eq!(merge(&[], &reversed), history);
    }

    #[test]
    fn merge_sorts_newest_first() {
        let merged = merge(&[change("a", at(1))], &[change("c", at(3)), change("b", at(2))]);
        let ids: Vec<&str> = merged.iter().map(|c| c.change_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn trim_drops_entries_past_retention() {
        let now = at(12) + Duration::days(50);
        let history = vec![
            change("new", now - Duration::days(1)),
            change("edge", now - Duration::days(RETENTION_DAYS)),
            change("old", now - Duration::days(RETENTION_DAYS) - Duration::seconds(1)),
        ];
        let trimmed = trim_history(&history, now);
        assert!(trimmed
            .iter()
            .all(|c| now - c.changed_at <= Duration::days(RETENTION_DAYS)));
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn seen_ids_are_capped_oldest_first() {
        let mut ids: Vec<String> = (0..SEEN_CAP + 5).map(|i| i.to_string()).collect();
        cap_seen(&mut ids);
        assert_eq!(ids.len(), SEEN_CAP);
        assert_eq!(ids.first().map(String::as_str), Some("5"));
        assert_eq!(ids.last(), Some(&(SEEN_CAP + 4).to_string()));
    }

    #[test]
    fn merge_changes_reports_only_unseen() {
        let mut state = TrackerPersistedState::fresh(&scope());
        let first = state.merge_changes(&[change("a", at(1)), change("b", at(2))]);
        assert_eq!(first.len(), 2);
        assert_eq!(state.seen_change_ids, vec!["a".to_string(), "b".into()]);

        let second = state.merge_changes(&[change("b", at(2)), change("c", at(3))]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].change_id, "c");
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.seen_change_ids.last().map(String::as_str), Some("c"));
    }

    #[test]
    fn lower_bound_applies_overlap_and_clamps() {
        let scope = scope();
        let mut state = TrackerPersistedState::fresh(&scope);
        assert_eq!(state.query_lower_bound(&scope), at(0));

        state.cursor = Some(at(1));
        assert_eq!(
            state.query_lower_bound(&scope),
            at(1) - Duration::minutes(OVERLAP_MINUTES)
        );

        state.cursor = Some(at(0) + Duration::minutes(5));
        assert_eq!(state.query_lower_bound(&scope), at(0));

        state.cursor = None;
        assert_eq!(state.query_lower_bound(&scope), at(0));
    }

    #[test]
    fn malformed_fields_default_individually() {
        let json = r#"{
            "scopeKey": "ws|p|it",
            "cursor": 12,
            "seenChangeIds": ["a", 3, "b"],
            "history": [{"changeId": "broken"}],
            "classifiedStories": "nope"
        }"#;
        let state: TrackerPersistedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.scope_key, "ws|p|it");
        assert_eq!(state.cursor, None);
        assert_eq!(state.seen_change_ids, vec!["a".to_string(), "b".into()]);
        assert!(state.history.is_empty());
        assert!(state.classified_stories.is_empty());
        assert_eq!(state.last_checked_at, None);
    }
}
