use anyhow::Result;
use tracing::info;

use crate::activity::{new_event, ActivityLog};
use crate::config::TrackerConfig;
use crate::model::story::ClassifiedStory;

/// Receives changes to a tracker's "testing required" set. Called at most
/// once per poll per tracker, never with both lists empty.
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        tracker: &TrackerConfig,
        added: &[ClassifiedStory],
        removed: &[ClassifiedStory],
    ) -> Result<()>;
}

fn formatted_ids(stories: &[ClassifiedStory]) -> Vec<String> {
    stories.iter().map(|s| s.formatted_id.clone()).collect()
}

pub fn summary(added: &[ClassifiedStory], removed: &[ClassifiedStory]) -> String {
    let mut parts = Vec::new();
    if !added.is_empty() {
        parts.push(format!("Ready for testing: {}", formatted_ids(added).join(", ")));
    }
    if !removed.is_empty() {
        parts.push(format!("No longer ready: {}", formatted_ids(removed).join(", ")));
    }
    parts.join(" | ")
}

/// Emits the notification as a log line and an activity-log entry.
pub struct ActivityNotifier {
    log: ActivityLog,
}

impl ActivityNotifier {
    pub fn new(log: ActivityLog) -> Self {
        Self { log }
    }
}

impl Notifier for ActivityNotifier {
    fn notify(
        &self,
        tracker: &TrackerConfig,
        added: &[ClassifiedStory],
        removed: &[ClassifiedStory],
    ) -> Result<()> {
        let message = summary(added, removed);
        info!(tracker = %tracker.id, added = added.len(), removed = removed.len(), "{message}");
        if !added.is_empty() {
            self.log.append(&new_event(
                &tracker.id,
                "testing-added",
                formatted_ids(added),
                Some(&message),
            ))?;
        }
        if !removed.is_empty() {
            self.log.append(&new_event(
                &tracker.id,
                "testing-removed",
                formatted_ids(removed),
                Some(&message),
            ))?;
        }
        Ok(())
    }
}
