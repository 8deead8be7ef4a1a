use std::collections::HashMap;

use crate::model::story::Story;
use crate::remote::lookback::FeedRecord;

/// Everything known about one story when a feed record is turned into a
/// change, in decreasing order of freshness.
pub struct Sources<'a> {
    pub story_id: &'a str,
    pub live: Option<&'a Story>,
    pub metadata: Option<&'a Story>,
    pub record: &'a FeedRecord,
    pub projects: &'a HashMap<String, String>,
    pub users: &'a HashMap<String, String>,
    pub base_url: &'a str,
}

pub type Resolver<T> = fn(&Sources<'_>) -> Option<T>;

/// Evaluates resolvers in order and returns the first value produced.
pub fn first_present<T>(sources: &Sources<'_>, chain: &[Resolver<T>]) -> Option<T> {
    chain.iter().find_map(|resolve| resolve(sources))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn live_formatted_id(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| non_empty(&l.formatted_id))
}
fn metadata_formatted_id(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| non_empty(&m.formatted_id))
}
fn feed_formatted_id(s: &Sources<'_>) -> Option<String> {
    s.record.formatted_id.as_deref().and_then(non_empty)
}
fn synthesized_formatted_id(s: &Sources<'_>) -> Option<String> {
    Some(format!("#{}", s.story_id))
}

pub const FORMATTED_ID: &[Resolver<String>] = &[
    live_formatted_id,
    metadata_formatted_id,
    feed_formatted_id,
    synthesized_formatted_id,
];

fn live_title(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| non_empty(&l.title))
}
fn metadata_title(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| non_empty(&m.title))
}
fn feed_title(s: &Sources<'_>) -> Option<String> {
    s.record.name.as_deref().and_then(non_empty)
}
fn untitled(_: &Sources<'_>) -> Option<String> {
    Some("(untitled)".to_string())
}

pub const TITLE: &[Resolver<String>] = &[live_title, metadata_title, feed_title, untitled];

fn live_owner(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| l.owner.clone())
}
fn metadata_owner(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| m.owner.clone())
}
fn feed_owner(s: &Sources<'_>) -> Option<String> {
    let owner = s.record.owner.as_ref()?.to_string();
    s.users.get(&owner).cloned()
}

pub const OWNER: &[Resolver<String>] = &[live_owner, metadata_owner, feed_owner];

fn live_status(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| l.status.clone())
}
fn metadata_status(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| m.status.clone())
}

pub const STATUS: &[Resolver<String>] = &[live_status, metadata_status];

fn live_ready(s: &Sources<'_>) -> Option<bool> {
    s.live.and_then(|l| l.ready)
}
fn metadata_ready(s: &Sources<'_>) -> Option<bool> {
    s.metadata.and_then(|m| m.ready)
}
fn feed_ready(s: &Sources<'_>) -> Option<bool> {
    s.record.ready
}

pub const READY: &[Resolver<bool>] = &[live_ready, metadata_ready, feed_ready];

fn live_schedule_state(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| l.schedule_state.clone())
}
fn metadata_schedule_state(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| m.schedule_state.clone())
}
fn feed_schedule_state(s: &Sources<'_>) -> Option<String> {
    s.record.schedule_state.clone()
}

pub const SCHEDULE_STATE: &[Resolver<String>] = &[
    live_schedule_state,
    metadata_schedule_state,
    feed_schedule_state,
];

/// Only current values: the "to" side of a transition never comes from
/// the snapshot itself.
pub const SCHEDULE_STATE_NOW: &[Resolver<String>] =
    &[live_schedule_state, metadata_schedule_state];

fn live_project(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| non_empty(&l.project_name))
}
fn metadata_project(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| non_empty(&m.project_name))
}
fn feed_project(s: &Sources<'_>) -> Option<String> {
    let project = s.record.project.as_ref()?.to_string();
    s.projects.get(&project).cloned()
}
fn unknown_project(_: &Sources<'_>) -> Option<String> {
    Some("Unknown Project".to_string())
}

pub const PROJECT_NAME: &[Resolver<String>] =
    &[live_project, metadata_project, feed_project, unknown_project];

fn live_url(s: &Sources<'_>) -> Option<String> {
    s.live.and_then(|l| non_empty(&l.url))
}
fn metadata_url(s: &Sources<'_>) -> Option<String> {
    s.metadata.and_then(|m| non_empty(&m.url))
}
fn synthesized_url(s: &Sources<'_>) -> Option<String> {
    Some(crate::remote::wsapi::detail_url(s.base_url, s.story_id))
}

pub const URL: &[Resolver<String>] = &[live_url, metadata_url, synthesized_url];

fn feed_actor(s: &Sources<'_>) -> Option<String> {
    let user = s.record.user.as_ref()?.to_string();
    s.users.get(&user).cloned()
}

pub const ACTOR: &[Resolver<String>] = &[feed_actor];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::lookback::RawId;

    fn story(title: &str, state: Option<&str>) -> Story {
        Story {
            story_id: "7".into(),
            formatted_id: "US7".into(),
            title: title.into(),
            owner: None,
            status: None,
            ready: None,
            schedule_state: state.map(String::from),
            project_name: String::new(),
            url: String::new(),
        }
    }

    struct Fixture {
        record: FeedRecord,
        projects: HashMap<String, String>,
        users: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                record: FeedRecord {
                    name: Some("Feed title".into()),
                    project: Some(RawId::Number(5)),
                    ..FeedRecord::default()
                },
                projects: HashMap::from([("5".to_string(), "Web".to_string())]),
                users: HashMap::new(),
            }
        }

        fn sources<'a>(
            &'a self,
            live: Option<&'a Story>,
            metadata: Option<&'a Story>,
        ) -> Sources<'a> {
            Sources {
                story_id: "7",
                live,
                metadata,
                record: &self.record,
                projects: &self.projects,
                users: &self.users,
                base_url: "https://rally.test",
            }
        }
    }

    #[test]
    fn live_beats_metadata_beats_feed() {
        let fixture = Fixture::new();
        let live = story("Live title", None);
        let meta = story("Meta title", None);

        let all = fixture.sources(Some(&live), Some(&meta));
        assert_eq!(first_present(&all, TITLE).as_deref(), Some("Live title"));

        let no_live = fixture.sources(None, Some(&meta));
        assert_eq!(first_present(&no_live, TITLE).as_deref(), Some("Meta title"));

        let feed_only = fixture.sources(None, None);
        assert_eq!(first_present(&feed_only, TITLE).as_deref(), Some("Feed title"));
    }

    #[test]
    fn blank_values_fall_through() {
        let fixture = Fixture::new();
        let live = story("   ", None);
        let sources = fixture.sources(Some(&live), None);
        assert_eq!(first_present(&sources, TITLE).as_deref(), Some("Feed title"));
    }

    #[test]
    fn literals_close_the_chain() {
        let mut fixture = Fixture::new();
        fixture.record = FeedRecord::default();
        let sources = fixture.sources(None, None);
        assert_eq!(first_present(&sources, FORMATTED_ID).as_deref(), Some("#7"));
        assert_eq!(first_present(&sources, TITLE).as_deref(), Some("(untitled)"));
        assert_eq!(
            first_present(&sources, PROJECT_NAME).as_deref(),
            Some("Unknown Project")
        );
        assert_eq!(
            first_present(&sources, URL).as_deref(),
            Some("https://rally.test/#/detail/userstory/7")
        );
        assert_eq!(first_present(&sources, OWNER), None);
    }

    #[test]
    fn project_resolves_through_lookup() {
        let fixture = Fixture::new();
        let sources = fixture.sources(None, None);
        assert_eq!(first_present(&sources, PROJECT_NAME).as_deref(), Some("Web"));
    }

    #[test]
    fn current_schedule_state_ignores_snapshot() {
        let mut fixture = Fixture::new();
        fixture.record.schedule_state = Some("Defined".into());
        let sources = fixture.sources(None, None);
        assert_eq!(first_present(&sources, SCHEDULE_STATE_NOW), None);
        assert_eq!(
            first_present(&sources, SCHEDULE_STATE).as_deref(),
            Some("Defined")
        );

        let live = story("t", Some("In-Progress"));
        let sources = fixture.sources(Some(&live), None);
        assert_eq!(
            first_present(&sources, SCHEDULE_STATE_NOW).as_deref(),
            Some("In-Progress")
        );
    }
}
