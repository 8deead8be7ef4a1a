//! Turns raw feed snapshots into normalized, deduplicated [`StoryChange`]s.

pub mod resolve;

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::story::{Story, StoryChange};
use crate::remote::lookback::FeedRecord;
use crate::remote::Lookups;
use resolve::{first_present, Sources};

const SCHEDULE_STATE_FIELD: &str = "ScheduleState";

/// Content-derived id: the same story, instant and field set always hash
/// to the same value regardless of which poll observed it.
pub fn change_id(story_id: &str, changed_at: DateTime<Utc>, changed_fields: &[String]) -> String {
    let mut fields: Vec<&str> = changed_fields.iter().map(String::as_str).collect();
    fields.sort_unstable();
    fields.dedup();
    let material = format!(
        "{story_id}:{}:{}",
        changed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        fields.join(",")
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

fn previous_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Extracts one change from a record, or `None` when the record carries
/// no diff, no story id or no usable timestamp.
pub fn extract_change(
    record: &FeedRecord,
    live: &HashMap<&str, &Story>,
    lookups: &Lookups,
    base_url: &str,
) -> Option<StoryChange> {
    let previous = record.previous_values.as_ref()?;
    let mut changed_fields: Vec<String> = previous.keys().cloned().collect();
    if changed_fields.is_empty() {
        return None;
    }
    changed_fields.sort();

    let story_id = record.story_id()?;
    let changed_at = record.changed_at()?;

    let sources = Sources {
        story_id: &story_id,
        live: live.get(story_id.as_str()).copied(),
        metadata: lookups.stories.get(&story_id),
        record,
        projects: &lookups.projects,
        users: &lookups.users,
        base_url,
    };

    let (schedule_state_from, schedule_state_to) = match previous.get(SCHEDULE_STATE_FIELD) {
        Some(from) => (
            previous_text(from),
            first_present(&sources, resolve::SCHEDULE_STATE_NOW),
        ),
        None => (None, None),
    };

    Some(StoryChange {
        change_id: change_id(&story_id, changed_at, &changed_fields),
        formatted_id: first_present(&sources, resolve::FORMATTED_ID).unwrap_or_default(),
        title: first_present(&sources, resolve::TITLE).unwrap_or_default(),
        owner: first_present(&sources, resolve::OWNER),
        status: first_present(&sources, resolve::STATUS),
        ready: first_present(&sources, resolve::READY),
        schedule_state: first_present(&sources, resolve::SCHEDULE_STATE),
        project_name: first_present(&sources, resolve::PROJECT_NAME).unwrap_or_default(),
        url: first_present(&sources, resolve::URL).unwrap_or_default(),
        actor: first_present(&sources, resolve::ACTOR),
        schedule_state_from,
        schedule_state_to,
        story_id,
        changed_at,
        changed_fields,
    })
}

/// Converts a feed page into changes, newest first, one per change id.
pub fn extract_changes(
    records: &[FeedRecord],
    live: &[Story],
    lookups: &Lookups,
    base_url: &str,
) -> Vec<StoryChange> {
    let live: HashMap<&str, &Story> = live.iter().map(|s| (s.story_id.as_str(), s)).collect();

    let mut by_id: HashMap<String, StoryChange> = HashMap::new();
    let mut discarded = 0usize;
    for record in records {
        match extract_change(record, &live, lookups, base_url) {
            Some(change) => {
                by_id.insert(change.change_id.clone(), change);
            }
            None => discarded += 1,
        }
    }
    if discarded > 0 {
        debug!(discarded, "feed records without a usable diff");
    }

    let mut changes: Vec<StoryChange> = by_id.into_values().collect();
    sort_newest_first(&mut changes);
    changes
}

/// Descending by `changed_at`; ties broken by change id so the order is
/// stable across runs.
pub fn sort_newest_first(changes: &mut [StoryChange]) {
    changes.sort_by(|a, b| {
        b.changed_at
            .cmp(&a.changed_at)
            .then_with(|| a.change_id.cmp(&b.change_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::lookback::RawId;
    use serde_json::{json, Map, Value};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(story: i64, valid_from: &str, previous: Value) -> FeedRecord {
        let previous: Map<String, Value> = previous.as_object().cloned().unwrap_or_default();
        FeedRecord {
            object_id: Some(RawId::Number(story)),
            formatted_id: Some(format!("US{story}")),
            name: Some(format!("Snapshot title {story}")),
            schedule_state: Some("Defined".into()),
            valid_from: Some(valid_from.to_string()),
            previous_values: Some(previous),
            project: Some(RawId::Number(5001)),
            user: Some(RawId::Number(77)),
            ..FeedRecord::default()
        }
    }

    fn live_story(id: &str, state: &str) -> Story {
        Story {
            story_id: id.into(),
            formatted_id: format!("US{id}"),
            title: format!("Live title {id}"),
            owner: Some("Dana".into()),
            status: None,
            ready: Some(true),
            schedule_state: Some(state.into()),
            project_name: "Web".into(),
            url: format!("https://rally.test/#/detail/userstory/{id}"),
        }
    }

    fn lookups() -> Lookups {
        Lookups {
            projects: HashMap::from([("5001".into(), "Web".into())]),
            users: HashMap::from([("77".into(), "Sam".into())]),
            ..Lookups::default()
        }
    }

    #[test]
    fn empty_previous_values_produce_nothing() {
        let records = vec![
            record(1, "2026-10-12T01:00:00.000Z", json!({})),
            FeedRecord {
                previous_values: None,
                ..record(2, "2026-10-12T01:00:00.000Z", json!({}))
            },
        ];
        assert!(extract_changes(&records, &[], &lookups(), "https://rally.test").is_empty());
    }

    #[test]
    fn records_without_timestamp_are_discarded() {
        let mut r = record(1, "", json!({ "Name": "Old" }));
        r.valid_from = None;
        let mut garbled = record(2, "yesterday", json!({ "Name": "Old" }));
        garbled.valid_from = Some("yesterday".into());
        assert!(extract_changes(&[r, garbled], &[], &lookups(), "https://rally.test").is_empty());
    }

    #[test]
    fn change_id_is_pure_and_order_insensitive() {
        let at = ts("2026-10-12T01:00:00Z");
        let a = change_id("1", at, &["Name".into(), "Ready".into()]);
        let b = change_id("1", at, &["Ready".into(), "Name".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, change_id("1", at, &["Name".into()]));
        assert_ne!(a, change_id("2", at, &["Name".into(), "Ready".into()]));
        assert_ne!(
            a,
            change_id("1", ts("2026-10-12T01:00:01Z"), &["Name".into(), "Ready".into()])
        );
    }

    #[test]
    fn separate_extractions_agree_on_ids() {
        let records = vec![record(1, "2026-10-12T01:00:00.000Z", json!({ "Name": "Old" }))];
        let first = extract_changes(&records, &[], &lookups(), "https://rally.test");
        let second = extract_changes(
            &records,
            &[live_story("1", "Defined")],
            &lookups(),
            "https://rally.test",
        );
        assert_eq!(first[0].change_id, second[0].change_id);
    }

    #[test]
    fn overlapping_records_collapse() {
        let records = vec![
            record(1, "2026-10-12T01:00:00.000Z", json!({ "Name": "Old", "Ready": false })),
            record(1, "2026-10-12T01:00:00.000Z", json!({ "Ready": false, "Name": "Old" })),
            record(1, "2026-10-12T02:00:00.000Z", json!({ "Name": "Older" })),
        ];
        let changes = extract_changes(&records, &[], &lookups(), "https://rally.test");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].changed_at, ts("2026-10-12T02:00:00Z"));
        assert_eq!(changes[1].changed_fields, vec!["Name".to_string(), "Ready".into()]);
    }

    #[test]
    fn live_data_wins_over_snapshot() {
        let records = vec![record(1, "2026-10-12T01:00:00.000Z", json!({ "Name": "Old" }))];
        let changes = extract_changes(
            &records,
            &[live_story("1", "Completed")],
            &lookups(),
            "https://rally.test",
        );
        let change = &changes[0];
        assert_eq!(change.title, "Live title 1");
        assert_eq!(change.schedule_state.as_deref(), Some("Completed"));
        assert_eq!(change.owner.as_deref(), Some("Dana"));
        assert_eq!(change.actor.as_deref(), Some("Sam"));
    }

    #[test]
    fn snapshot_fills_in_for_stories_that_left_the_sprint() {
        let records = vec![record(9, "2026-10-12T01:00:00.000Z", json!({ "Iteration": 9001 }))];
        let changes = extract_changes(&records, &[], &lookups(), "https://rally.test");
        let change = &changes[0];
        assert_eq!(change.formatted_id, "US9");
        assert_eq!(change.title, "Snapshot title 9");
        assert_eq!(change.project_name, "Web");
        assert_eq!(change.url, "https://rally.test/#/detail/userstory/9");
    }

    #[test]
    fn schedule_transition_uses_previous_and_current() {
        let records = vec![record(
            1,
            "2026-10-12T01:00:00.000Z",
            json!({ "ScheduleState": "Defined" }),
        )];
        let changes = extract_changes(
            &records,
            &[live_story("1", "In-Progress")],
            &lookups(),
            "https://rally.test",
        );
        assert_eq!(changes[0].schedule_state_from.as_deref(), Some("Defined"));
        assert_eq!(changes[0].schedule_state_to.as_deref(), Some("In-Progress"));
    }

    #[test]
    fn missing_transition_sides_stay_unset() {
        let records = vec![
            record(1, "2026-10-12T01:00:00.000Z", json!({ "ScheduleState": null })),
            record(2, "2026-10-12T01:00:00.000Z", json!({ "Name": "Old" })),
        ];
        let changes = extract_changes(&records, &[], &lookups(), "https://rally.test");
        let first = changes.iter().find(|c| c.story_id == "1").unwrap();
        assert_eq!(first.schedule_state_from, None);
        assert_eq!(first.schedule_state_to, None);
        let second = changes.iter().find(|c| c.story_id == "2").unwrap();
        assert_eq!(second.schedule_state_from, None);
        assert_eq!(second.schedule_state_to, None);
    }
}
