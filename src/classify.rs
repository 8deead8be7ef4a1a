use std::collections::HashSet;

use crate::model::story::{ClassifiedStory, Story};

/// Lower-cases and collapses runs of whitespace, underscores and hyphens
/// into a single hyphen: "In Progress", "in_progress" and "IN-PROGRESS"
/// all become "in-progress".
pub fn normalize_schedule_state(state: &str) -> String {
    state
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Ready for validation: flagged ready and currently in progress.
pub fn needs_testing(story: &Story) -> bool {
    story.ready == Some(true)
        && story
            .schedule_state
            .as_deref()
            .map(normalize_schedule_state)
            .is_some_and(|s| s == "in-progress")
}

pub fn classify(stories: &[Story]) -> Vec<ClassifiedStory> {
    let mut set: Vec<ClassifiedStory> = stories
        .iter()
        .filter(|s| needs_testing(s))
        .map(ClassifiedStory::from)
        .collect();
    set.sort_by(|a, b| a.formatted_id.cmp(&b.formatted_id));
    set.dedup_by(|a, b| a.story_id == b.story_id);
    set
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationDiff {
    pub added: Vec<ClassifiedStory>,
    pub removed: Vec<ClassifiedStory>,
    previous_len: usize,
    current_len: usize,
}

impl ClassificationDiff {
    /// Fires only when the set size changed. A same-size swap (one story in,
    /// another out) is not reported.
    pub fn should_notify(&self) -> bool {
        self.previous_len != self.current_len
    }
}

pub fn diff(previous: &[ClassifiedStory], current: &[ClassifiedStory]) -> ClassificationDiff {
    let before: HashSet<&str> = previous.iter().map(|s| s.story_id.as_str()).collect();
    let after: HashSet<&str> = current.iter().map(|s| s.story_id.as_str()).collect();

    ClassificationDiff {
        added: current
            .iter()
            .filter(|s| !before.contains(s.story_id.as_str()))
            .cloned()
            .collect(),
        removed: previous
            .iter()
            .filter(|s| !after.contains(s.story_id.as_str()))
            .cloned()
            .collect(),
        previous_len: before.len(),
        current_len: after.len(),
    }
}
