use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live state of a story as returned by the current-state query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub story_id: String,
    pub formatted_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Tri-state: `None` means the service did not report the flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_state: Option<String>,
    pub project_name: String,
    pub url: String,
}

/// One entry of the change log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryChange {
    pub change_id: String,
    pub story_id: String,
    pub formatted_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_state: Option<String>,
    pub project_name: String,
    pub url: String,
    pub changed_at: DateTime<Utc>,
    pub changed_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_state_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_state_to: Option<String>,
}

/// Member of the "testing required" set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedStory {
    pub story_id: String,
    pub formatted_id: String,
}

impl From<&Story> for ClassifiedStory {
    fn from(story: &Story) -> Self {
        Self {
            story_id: story.story_id.clone(),
            formatted_id: story.formatted_id.clone(),
        }
    }
}
