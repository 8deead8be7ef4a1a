use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a tracker watches: one sprint across a set of projects in a workspace.
///
/// Equality ignores `sprint_start`; two scopes are the same when their
/// [`key`](TrackerScope::key) matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerScope {
    pub workspace_id: String,
    pub project_ids: Vec<String>,
    pub iteration_id: String,
    pub sprint_start: DateTime<Utc>,
}

impl TrackerScope {
    pub fn new(
        workspace_id: impl Into<String>,
        project_ids: impl IntoIterator<Item = String>,
        iteration_id: impl Into<String>,
        sprint_start: DateTime<Utc>,
    ) -> Self {
        let mut project_ids: Vec<String> = project_ids
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        project_ids.sort();
        project_ids.dedup();
        Self {
            workspace_id: workspace_id.into(),
            project_ids,
            iteration_id: iteration_id.into(),
            sprint_start,
        }
    }

    /// Fencing key persisted next to tracker state.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.workspace_id,
            self.project_ids.join(","),
            self.iteration_id
        )
    }
}

impl PartialEq for TrackerScope {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TrackerScope {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap()
    }

    #[test]
    fn key_ignores_project_order_and_duplicates() {
        let a = TrackerScope::new("ws", vec!["2".into(), "1".into()], "it", start());
        let b = TrackerScope::new("ws", vec!["1".into(), "2".into(), "1".into()], "it", start());
        assert_eq!(a.key(), "ws|1,2|it");
        assert_eq!(a, b);
    }

    #[test]
    fn sprint_change_changes_key() {
        let a = TrackerScope::new("ws", vec!["1".into()], "it-1", start());
        let b = TrackerScope::new("ws", vec!["1".into()], "it-2", start());
        assert_ne!(a, b);
    }

    #[test]
    fn start_date_is_not_part_of_identity() {
        let a = TrackerScope::new("ws", vec!["1".into()], "it", start());
        let b = TrackerScope::new(
            "ws",
            vec!["1".into()],
            "it",
            start() + chrono::Duration::days(1),
        );
        assert_eq!(a, b);
    }
}
