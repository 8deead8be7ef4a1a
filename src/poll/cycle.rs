use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::changes::extract_changes;
use crate::model::scope::TrackerScope;
use crate::model::story::{Story, StoryChange};
use crate::remote::error::RemoteError;
use crate::remote::lookback::FeedPage;
use crate::remote::{RemoteClient, SprintRef};
use crate::store::state::OVERLAP_MINUTES;

/// Network half of a poll. Holds no locks and mutates nothing.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub sprint: SprintRef,
    pub stories: Vec<Story>,
    pub changes: Vec<StoryChange>,
    pub next_cursor: DateTime<Utc>,
}

pub async fn fetch_cycle(
    client: &RemoteClient,
    credential: &str,
    scope: &TrackerScope,
    lower_bound: DateTime<Utc>,
    observed_at: DateTime<Utc>,
) -> Result<CycleResult, RemoteError> {
    let sprint = client.resolve_sprint(credential, scope).await?;
    let (stories, feed) = tokio::try_join!(
        client.fetch_current_stories(credential, scope, &sprint),
        client.fetch_feed(credential, scope, &sprint, lower_bound),
    )?;
    let lookups = client
        .fetch_lookups(credential, &scope.workspace_id, &feed, &stories)
        .await?;
    let changes = extract_changes(&feed.records, &stories, &lookups, client.base_url());

    Ok(CycleResult {
        next_cursor: next_cursor(&feed, lower_bound, observed_at),
        sprint,
        stories,
        changes,
    })
}

/// Where the next poll resumes. A complete feed page moves the cursor to
/// the observation time. A full page stops it at the last consumed record;
/// if the whole page sat inside the overlap window the cursor is pushed far
/// enough that the next window starts exactly at that record. A full page
/// that never left the lower bound instant cannot be split by time, so the
/// cursor steps past that instant.
pub fn next_cursor(
    feed: &FeedPage,
    lower_bound: DateTime<Utc>,
    observed_at: DateTime<Utc>,
) -> DateTime<Utc> {
    let overlap = Duration::minutes(OVERLAP_MINUTES);
    match feed.last_changed_at() {
        Some(last) if feed.truncated => {
            let cursor = if last <= lower_bound {
                warn!(
                    at = %last,
                    records = feed.records.len(),
                    "feed burst at one instant exceeds the page cap, skipping past it"
                );
                last + overlap + Duration::milliseconds(1)
            } else if last - overlap <= lower_bound {
                last + overlap
            } else {
                last
            };
            cursor.min(observed_at)
        }
        _ => observed_at,
    }
}
