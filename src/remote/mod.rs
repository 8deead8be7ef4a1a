pub mod backoff;
pub mod error;
pub mod lookback;
pub mod transport;
pub mod wsapi;


use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::model::scope::TrackerScope;
use crate::model::story::Story;
use backoff::BackoffPolicy;
use error::{classify_status, RemoteError, StatusClass};
use lookback::{FeedPage, FEED_PAGE_SIZE};
use transport::{Transport, TransportRequest};
use wsapi::{
    WsIteration, WsProject, WsStory, WsUser, WsapiQuery, LOOKUP_CHUNK, MAX_PAGES, PAGE_SIZE,
};

/// The sprint as the service knows it. `ids` holds the selected iteration
/// first, followed by same-named copies living in other project hierarchies.
#[derive(Debug, Clone, PartialEq)]
pub struct SprintRef {
    pub ids: Vec<String>,
    pub name: String,
    pub start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct IterationInfo {
    pub id: String,
    pub name: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Id-keyed data fetched once per poll to fill in what the feed only
/// references by number.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub stories: HashMap<String, Story>,
    pub projects: HashMap<String, String>,
    pub users: HashMap<String, String>,
}

pub struct RemoteClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    backoff: BackoffPolicy,
}

impl RemoteClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one request and decodes the body with `parse`, retrying
    /// transport failures, 429/5xx and bodies that are not JSON or do not
    /// decode. Authentication failures return immediately.
    async fn execute_json<T, F>(
        &self,
        credential: &str,
        method: Method,
        url: &str,
        body: Option<String>,
        parse: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn(serde_json::Value) -> Result<T, RemoteError>,
    {
        let request = TransportRequest {
            url: url.to_string(),
            method,
            body,
            credential: credential.to_string(),
        };

        let attempts = self.backoff.total_attempts();
        let mut attempt = 0;
        loop {
            let result = match self.transport.execute(request.clone()).await {
                Err(e) => Err(RemoteError::Transient(format!("{e:#}"))),
                Ok(resp) => match classify_status(resp.status) {
                    StatusClass::Success => serde_json::from_str(&resp.body)
                        .map_err(|e| RemoteError::Malformed(e.to_string()))
                        .and_then(&parse),
                    StatusClass::Authentication => {
                        return Err(RemoteError::Authentication {
                            status: resp.status,
                        })
                    }
                    StatusClass::Retryable => {
                        Err(RemoteError::Transient(format!("HTTP {}", resp.status)))
                    }
                    StatusClass::Rejected => {
                        return Err(RemoteError::Rejected {
                            status: resp.status,
                            message: resp.body.chars().take(200).collect(),
                        })
                    }
                },
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts && err.is_retryable() => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        ?delay,
                        error = %err,
                        "retrying remote request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Walks every page of a list query. A short page ends the walk; a
    /// full page always triggers one more fetch.
    pub async fn query_all<T: DeserializeOwned>(
        &self,
        credential: &str,
        query: &WsapiQuery,
    ) -> Result<Vec<T>, RemoteError> {
        let mut out = Vec::new();
        for page in 0..MAX_PAGES {
            let url = query.url(&self.base_url, page * PAGE_SIZE + 1, PAGE_SIZE);
            let results: Vec<T> = self
                .execute_json(credential, Method::GET, &url, None, wsapi::parse_page::<T>)
                .await?;
            let count = results.len();
            out.extend(results);
            if count < PAGE_SIZE {
                return Ok(out);
            }
        }
        warn!(entity = query.entity, pages = MAX_PAGES, "page cap reached, results truncated");
        Ok(out)
    }

    pub async fn fetch_iteration(
        &self,
        credential: &str,
        iteration_id: &str,
    ) -> Result<WsIteration, RemoteError> {
        let url = wsapi::iteration_url(&self.base_url, iteration_id);
        self.execute_json(credential, Method::GET, &url, None, wsapi::parse_iteration)
            .await
    }

    /// Resolves the selected iteration plus any duplicates sharing its name
    /// and start date elsewhere in the workspace.
    pub async fn resolve_sprint(
        &self,
        credential: &str,
        scope: &TrackerScope,
    ) -> Result<SprintRef, RemoteError> {
        let primary = self.fetch_iteration(credential, &scope.iteration_id).await?;
        let query = WsapiQuery {
            entity: "iteration",
            workspace_id: scope.workspace_id.clone(),
            project_id: None,
            query: Some(wsapi::sibling_iteration_query(&primary.name, primary.start_date)),
            fetch: wsapi::ITERATION_FIELDS,
            order: None,
        };
        let siblings: Vec<WsIteration> = self.query_all(credential, &query).await?;

        let mut ids = vec![scope.iteration_id.clone()];
        for sibling in siblings {
            let id = sibling.object_id.to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.len() > 1 {
            debug!(name = %primary.name, count = ids.len(), "sprint duplicated across hierarchies");
        }

        Ok(SprintRef {
            ids,
            name: primary.name,
            start: primary.start_date,
        })
    }

    fn story_query(
        &self,
        workspace_id: &str,
        project_id: &str,
        query: Option<String>,
    ) -> WsapiQuery {
        WsapiQuery {
            entity: "hierarchicalrequirement",
            workspace_id: workspace_id.to_string(),
            project_id: Some(project_id.to_string()),
            query,
            fetch: wsapi::STORY_FIELDS,
            order: Some("FormattedID"),
        }
    }

    async fn project_stories(
        &self,
        credential: &str,
        scope: &TrackerScope,
        project_id: &str,
        sprint: &SprintRef,
    ) -> Result<Vec<WsStory>, RemoteError> {
        let by_id = self.story_query(
            &scope.workspace_id,
            project_id,
            wsapi::iteration_id_query(&sprint.ids),
        );
        let stories: Vec<WsStory> = self.query_all(credential, &by_id).await?;
        if !stories.is_empty() || sprint.name.is_empty() {
            return Ok(stories);
        }

        debug!(project_id, sprint = %sprint.name, "no stories by iteration id, querying by name");
        let by_name = self.story_query(
            &scope.workspace_id,
            project_id,
            Some(wsapi::iteration_name_query(&sprint.name)),
        );
        self.query_all(credential, &by_name).await
    }

    /// Live stories in the sprint across every configured project, one per
    /// story id, ordered by formatted id.
    pub async fn fetch_current_stories(
        &self,
        credential: &str,
        scope: &TrackerScope,
        sprint: &SprintRef,
    ) -> Result<Vec<Story>, RemoteError> {
        let per_project = try_join_all(
            scope
                .project_ids
                .iter()
                .map(|project_id| self.project_stories(credential, scope, project_id, sprint)),
        )
        .await?;

        let mut by_id: BTreeMap<String, Story> = BTreeMap::new();
        for story in per_project.into_iter().flatten() {
            let story = story.into_story(&self.base_url);
            by_id.insert(story.story_id.clone(), story);
        }
        let mut stories: Vec<Story> = by_id.into_values().collect();
        stories.sort_by(|a, b| a.formatted_id.cmp(&b.formatted_id));
        Ok(stories)
    }

    /// Feed records at or after `since`, oldest first. Normally one capped
    /// page; while every record so far shares a single change instant the
    /// walk continues by offset, since a cursor cannot split that instant.
    pub async fn fetch_feed(
        &self,
        credential: &str,
        scope: &TrackerScope,
        sprint: &SprintRef,
        since: DateTime<Utc>,
    ) -> Result<FeedPage, RemoteError> {
        let url = lookback::snapshot_url(&self.base_url, &scope.workspace_id);
        let mut feed = FeedPage::default();
        for page in 0..MAX_PAGES {
            let start = page * FEED_PAGE_SIZE;
            let body =
                lookback::snapshot_query(&sprint.ids, since, start, FEED_PAGE_SIZE).to_string();
            let next = self
                .execute_json(credential, Method::POST, &url, Some(body), |v| {
                    lookback::parse_snapshot_page(v, FEED_PAGE_SIZE)
                })
                .await?;
            feed.records.extend(next.records);
            feed.truncated = next.truncated;
            if !feed.truncated || !feed.spans_single_instant() {
                break;
            }
            debug!(records = feed.records.len(), "full feed page at one instant, paging on");
        }
        if feed.truncated {
            debug!(records = feed.records.len(), "feed page full, remainder deferred");
        }
        Ok(feed)
    }

    async fn lookup_by_ids<T: DeserializeOwned>(
        &self,
        credential: &str,
        workspace_id: &str,
        entity: &'static str,
        fetch: &'static [&'static str],
        ids: &[String],
    ) -> Result<Vec<T>, RemoteError> {
        let mut out = Vec::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let query = WsapiQuery {
                entity,
                workspace_id: workspace_id.to_string(),
                project_id: None,
                query: wsapi::object_id_query(chunk),
                fetch,
                order: None,
            };
            out.extend(self.query_all::<T>(credential, &query).await?);
        }
        Ok(out)
    }

    pub async fn fetch_story_metadata(
        &self,
        credential: &str,
        workspace_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Story>, RemoteError> {
        let stories: Vec<WsStory> = self
            .lookup_by_ids(
                credential,
                workspace_id,
                "hierarchicalrequirement",
                wsapi::STORY_FIELDS,
                ids,
            )
            .await?;
        Ok(stories
            .into_iter()
            .map(|s| {
                let story = s.into_story(&self.base_url);
                (story.story_id.clone(), story)
            })
            .collect())
    }

    pub async fn fetch_project_names(
        &self,
        credential: &str,
        workspace_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, String>, RemoteError> {
        let projects: Vec<WsProject> = self
            .lookup_by_ids(credential, workspace_id, "project", wsapi::PROJECT_FIELDS, ids)
            .await?;
        Ok(projects
            .into_iter()
            .map(|p| (p.object_id.to_string(), p.name))
            .collect())
    }

    pub async fn fetch_user_names(
        &self,
        credential: &str,
        workspace_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, String>, RemoteError> {
        let users: Vec<WsUser> = self
            .lookup_by_ids(credential, workspace_id, "user", wsapi::USER_FIELDS, ids)
            .await?;
        Ok(users
            .into_iter()
            .filter_map(|u| Some((u.object_id.to_string(), u.label()?)))
            .collect())
    }

    /// Batch-fetches everything the feed references by id that the live
    /// story set does not already cover.
    pub async fn fetch_lookups(
        &self,
        credential: &str,
        workspace_id: &str,
        feed: &FeedPage,
        live: &[Story],
    ) -> Result<Lookups, RemoteError> {
        let mut story_ids: Vec<String> = feed
            .records
            .iter()
            .filter_map(|r| r.story_id())
            .filter(|id| !live.iter().any(|s| &s.story_id == id))
            .collect();
        let mut project_ids: Vec<String> = feed
            .records
            .iter()
            .filter_map(|r| r.project.as_ref().map(ToString::to_string))
            .collect();
        let mut user_ids: Vec<String> = feed
            .records
            .iter()
            .flat_map(|r| [r.user.as_ref(), r.owner.as_ref()])
            .flatten()
            .map(ToString::to_string)
            .collect();
        for ids in [&mut story_ids, &mut project_ids, &mut user_ids] {
            ids.sort();
            ids.dedup();
        }

        let (stories, projects, users) = tokio::try_join!(
            self.fetch_story_metadata(credential, workspace_id, &story_ids),
            self.fetch_project_names(credential, workspace_id, &project_ids),
            self.fetch_user_names(credential, workspace_id, &user_ids),
        )?;

        Ok(Lookups {
            stories,
            projects,
            users,
        })
    }

    /// Iterations visible from a project, newest first.
    pub async fn list_iterations(
        &self,
        credential: &str,
        workspace_id: &str,
        project_id: &str,
    ) -> Result<Vec<IterationInfo>, RemoteError> {
        let query = WsapiQuery {
            entity: "iteration",
            workspace_id: workspace_id.to_string(),
            project_id: Some(project_id.to_string()),
            query: None,
            fetch: wsapi::ITERATION_FIELDS,
            order: Some("StartDate desc"),
        };
        let iterations: Vec<WsIteration> = self.query_all(credential, &query).await?;
        Ok(iterations
            .into_iter()
            .map(|i| IterationInfo {
                id: i.object_id.to_string(),
                name: i.name,
                start: i.start_date,
                end: i.end_date,
            })
            .collect())
    }
}
