use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::error::RemoteError;

pub const FEED_PAGE_SIZE: usize = 200;

pub const FEED_FIELDS: &[&str] = &[
    "ObjectID",
    "FormattedID",
    "Name",
    "ScheduleState",
    "Ready",
    "Owner",
    "Project",
    "_ValidFrom",
    "_PreviousValues",
    "_User",
];

pub fn snapshot_url(base_url: &str, workspace_id: &str) -> String {
    format!(
        "{}/analytics/v2.0/service/rally/workspace/{workspace_id}/artifact/snapshot/query.js",
        base_url.trim_end_matches('/')
    )
}

/// Ids go out as numbers when they look numeric, which is how the feed
/// stores them.
fn id_value(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id))
}

/// Body for one time-ranged page of story snapshots. The lower bound is
/// inclusive; `start` is a zero-based record offset.
pub fn snapshot_query(
    sprint_ids: &[String],
    since: DateTime<Utc>,
    start: usize,
    pagesize: usize,
) -> Value {
    let ids: Vec<Value> = sprint_ids.iter().map(|id| id_value(id)).collect();
    json!({
        "find": {
            "_TypeHierarchy": "HierarchicalRequirement",
            "Iteration": { "$in": ids },
            "_ValidFrom": { "$gte": since.to_rfc3339_opts(SecondsFormat::Millis, true) },
        },
        "fields": FEED_FIELDS,
        "hydrate": ["ScheduleState", "_PreviousValues.ScheduleState"],
        "sort": { "_ValidFrom": 1 },
        "start": start,
        "pagesize": pagesize,
        "removeUnauthorizedSnapshots": true,
    })
}

/// An id that the feed may deliver as either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawId::Number(n) => write!(f, "{n}"),
            RawId::Text(s) => f.write_str(s),
        }
    }
}

/// One snapshot from the feed. Every field is optional; the extractor
/// decides what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedRecord {
    #[serde(rename = "ObjectID")]
    pub object_id: Option<RawId>,
    #[serde(rename = "FormattedID")]
    pub formatted_id: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "ScheduleState")]
    pub schedule_state: Option<String>,
    #[serde(rename = "Ready")]
    pub ready: Option<bool>,
    #[serde(rename = "Owner")]
    pub owner: Option<RawId>,
    #[serde(rename = "Project")]
    pub project: Option<RawId>,
    #[serde(rename = "_ValidFrom")]
    pub valid_from: Option<String>,
    #[serde(rename = "_PreviousValues", default)]
    pub previous_values: Option<Map<String, Value>>,
    #[serde(rename = "_User")]
    pub user: Option<RawId>,
}

impl FeedRecord {
    pub fn story_id(&self) -> Option<String> {
        self.object_id.as_ref().map(ToString::to_string)
    }

    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.valid_from
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub records: Vec<FeedRecord>,
    /// The page came back full, so more records may be waiting.
    pub truncated: bool,
}

impl FeedPage {
    /// Latest effective-change time among the consumed records.
    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.records.iter().filter_map(FeedRecord::changed_at).max()
    }

    /// Every dated record carries the same change time.
    pub fn spans_single_instant(&self) -> bool {
        let first = self.records.iter().filter_map(FeedRecord::changed_at).min();
        match (first, self.last_changed_at()) {
            (Some(first), Some(last)) => first == last,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Records that do not fit the expected shape are skipped rather than
/// failing the whole page.
pub fn parse_snapshot_page(body: Value, pagesize: usize) -> Result<FeedPage, RemoteError> {
    let response: SnapshotResponse = serde_json::from_value(body)
        .map_err(|e| RemoteError::Malformed(format!("snapshot response: {e}")))?;
    if !response.errors.is_empty() {
        return Err(RemoteError::Rejected {
            status: 200,
            message: response.errors.join("; "),
        });
    }
    let truncated = response.results.len() >= pagesize;
    let records = response
        .results
        .into_iter()
        .filter_map(|raw| serde_json::from_value::<FeedRecord>(raw).ok())
        .collect();
    Ok(FeedPage { records, truncated })
}
