use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::error::RemoteError;
use crate::model::story::Story;

pub const API_ROOT: &str = "slm/webservice/v2.0";
pub const PAGE_SIZE: usize = 200;
pub const MAX_PAGES: usize = 50;
/// Ids per OR-chained lookup query; keeps URLs well under server limits.
pub const LOOKUP_CHUNK: usize = 25;

pub const STORY_FIELDS: &[&str] = &[
    "ObjectID",
    "FormattedID",
    "Name",
    "Owner",
    "FlowState",
    "ScheduleState",
    "Ready",
    "Project",
    "Iteration",
];
pub const ITERATION_FIELDS: &[&str] = &["ObjectID", "Name", "StartDate", "EndDate"];
pub const PROJECT_FIELDS: &[&str] = &["ObjectID", "Name"];
pub const USER_FIELDS: &[&str] = &["ObjectID", "DisplayName", "UserName"];

/// A live-entity list query. Paging parameters are added per request.
#[derive(Debug, Clone)]
pub struct WsapiQuery {
    pub entity: &'static str,
    pub workspace_id: String,
    pub project_id: Option<String>,
    pub query: Option<String>,
    pub fetch: &'static [&'static str],
    pub order: Option<&'static str>,
}

impl WsapiQuery {
    pub fn url(&self, base_url: &str, start: usize, pagesize: usize) -> String {
        let mut url = format!(
            "{}/{API_ROOT}/{}?workspace=/workspace/{}",
            base_url.trim_end_matches('/'),
            self.entity,
            self.workspace_id
        );
        if let Some(project) = &self.project_id {
            url.push_str(&format!(
                "&project=/project/{project}&projectScopeUp=false&projectScopeDown=false"
            ));
        }
        if let Some(query) = &self.query {
            url.push_str(&format!("&query={}", urlencoding::encode(query)));
        }
        url.push_str(&format!("&fetch={}", self.fetch.join(",")));
        if let Some(order) = self.order {
            url.push_str(&format!("&order={}", urlencoding::encode(order)));
        }
        url.push_str(&format!("&start={start}&pagesize={pagesize}"));
        url
    }
}

pub fn iteration_url(base_url: &str, iteration_id: &str) -> String {
    format!(
        "{}/{API_ROOT}/iteration/{iteration_id}?fetch={}",
        base_url.trim_end_matches('/'),
        ITERATION_FIELDS.join(",")
    )
}

pub fn detail_url(base_url: &str, story_id: &str) -> String {
    format!(
        "{}/#/detail/userstory/{story_id}",
        base_url.trim_end_matches('/')
    )
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Folds clauses into the binary, fully parenthesised form the query
/// language requires: `((A) OR (B)) OR (C)`.
pub fn or_query(clauses: &[String]) -> Option<String> {
    let mut iter = clauses.iter();
    let first = iter.next()?.clone();
    Some(iter.fold(first, |acc, clause| format!("({acc} OR {clause})")))
}

pub fn iteration_id_query(iteration_ids: &[String]) -> Option<String> {
    let clauses: Vec<String> = iteration_ids
        .iter()
        .map(|id| format!("(Iteration.ObjectID = {id})"))
        .collect();
    or_query(&clauses)
}

pub fn iteration_name_query(name: &str) -> String {
    format!("(Iteration.Name = {})", quote(name))
}

pub fn object_id_query(ids: &[String]) -> Option<String> {
    let clauses: Vec<String> = ids.iter().map(|id| format!("(ObjectID = {id})")).collect();
    or_query(&clauses)
}

/// Iterations that share a name and start date with the selected one.
pub fn sibling_iteration_query(name: &str, start: Option<DateTime<Utc>>) -> String {
    match start {
        Some(start) => format!(
            "((Name = {}) AND (StartDate = {}))",
            quote(name),
            quote(&start.to_rfc3339_opts(SecondsFormat::Millis, true))
        ),
        None => format!("(Name = {})", quote(name)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryEnvelope<T> {
    query_result: QueryResult<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryResult<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    errors: Vec<String>,
}

pub fn parse_page<T: DeserializeOwned>(body: serde_json::Value) -> Result<Vec<T>, RemoteError> {
    let envelope: QueryEnvelope<T> = serde_json::from_value(body)
        .map_err(|e| RemoteError::Malformed(format!("query result: {e}")))?;
    if !envelope.query_result.errors.is_empty() {
        return Err(RemoteError::Rejected {
            status: 200,
            message: envelope.query_result.errors.join("; "),
        });
    }
    Ok(envelope.query_result.results)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefObject {
    #[serde(rename = "_refObjectName")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsStory {
    #[serde(rename = "ObjectID")]
    pub object_id: i64,
    #[serde(rename = "FormattedID")]
    pub formatted_id: Option<String>,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Owner")]
    pub owner: Option<RefObject>,
    #[serde(rename = "FlowState")]
    pub flow_state: Option<RefObject>,
    #[serde(rename = "ScheduleState")]
    pub schedule_state: Option<String>,
    #[serde(rename = "Ready")]
    pub ready: Option<bool>,
    #[serde(rename = "Project")]
    pub project: Option<RefObject>,
}

impl WsStory {
    pub fn into_story(self, base_url: &str) -> Story {
        let story_id = self.object_id.to_string();
        Story {
            url: detail_url(base_url, &story_id),
            formatted_id: self
                .formatted_id
                .unwrap_or_else(|| format!("#{story_id}")),
            title: self.name.unwrap_or_default(),
            owner: self.owner.and_then(|o| o.name),
            status: self.flow_state.and_then(|f| f.name),
            ready: self.ready,
            schedule_state: self.schedule_state,
            project_name: self
                .project
                .and_then(|p| p.name)
                .unwrap_or_default(),
            story_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsIteration {
    #[serde(rename = "ObjectID")]
    pub object_id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "StartDate")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(rename = "EndDate")]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct IterationEnvelope {
    #[serde(rename = "Iteration")]
    iteration: WsIteration,
}

pub fn parse_iteration(body: serde_json::Value) -> Result<WsIteration, RemoteError> {
    serde_json::from_value::<IterationEnvelope>(body)
        .map(|e| e.iteration)
        .map_err(|e| RemoteError::Malformed(format!("iteration: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsProject {
    #[serde(rename = "ObjectID")]
    pub object_id: i64,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsUser {
    #[serde(rename = "ObjectID")]
    pub object_id: i64,
    #[serde(rename = "DisplayName")]
    pub display_name: Option<String>,
    #[serde(rename = "UserName")]
    pub user_name: Option<String>,
}

impl WsUser {
    pub fn label(&self) -> Option<String> {
        self.display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| self.user_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn or_query_nests_pairwise() {
        let clauses = vec!["(A = 1)".to_string(), "(A = 2)".into(), "(A = 3)".into()];
        assert_eq!(
            or_query(&clauses).unwrap(),
            "(((A = 1) OR (A = 2)) OR (A = 3))"
        );
        assert_eq!(or_query(&clauses[..1]).unwrap(), "(A = 1)");
        assert!(or_query(&[]).is_none());
    }

    #[test]
    fn names_are_quoted_and_escaped() {
        assert_eq!(
            iteration_name_query(r#"Sprint "12""#),
            r#"(Iteration.Name = "Sprint \"12\"")"#
        );
    }

    #[test]
    fn url_scopes_to_project_without_scope_creep() {
        let query = WsapiQuery {
            entity: "hierarchicalrequirement",
            workspace_id: "10".into(),
            project_id: Some("20".into()),
            query: iteration_id_query(&["30".into()]),
            fetch: &["ObjectID", "Name"],
            order: None,
        };
        let url = query.url("https://rally.example/", 201, 200);
        assert!(url.starts_with(
            "https://rally.example/slm/webservice/v2.0/hierarchicalrequirement?workspace=/workspace/10"
        ));
        assert!(url.contains("&project=/project/20&projectScopeUp=false&projectScopeDown=false"));
        assert!(url.contains("&query=%28Iteration.ObjectID%20%3D%2030%29"));
        assert!(url.contains("&fetch=ObjectID,Name"));
        assert!(url.ends_with("&start=201&pagesize=200"));
    }

    #[test]
    fn story_maps_reference_names() {
        let raw = json!({
            "ObjectID": 777,
            "FormattedID": "US42",
            "Name": "Checkout",
            "Owner": { "_refObjectName": "Dana" },
            "FlowState": { "_refObjectName": "In Dev" },
            "ScheduleState": "In-Progress",
            "Ready": true,
            "Project": { "_refObjectName": "Web", "ObjectID": 5 }
        });
        let story = serde_json::from_value::<WsStory>(raw)
            .unwrap()
            .into_story("https://rally.example");
        assert_eq!(story.story_id, "777");
        assert_eq!(story.owner.as_deref(), Some("Dana"));
        assert_eq!(story.status.as_deref(), Some("In Dev"));
        assert_eq!(story.ready, Some(true));
        assert_eq!(story.url, "https://rally.example/#/detail/userstory/777");
    }

    #[test]
    fn query_errors_are_rejections() {
        let body = json!({ "QueryResult": { "Results": [], "Errors": ["Could not parse"] } });
        let err = parse_page::<WsStory>(body).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { .. }));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = parse_page::<WsStory>(json!({ "nope": true })).unwrap_err();
        assert!(matches!(err, RemoteError::Malformed(_)));
    }

    #[test]
    fn sibling_query_pins_start_date() {
        let start = DateTime::parse_from_rfc3339("2026-10-12T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            sibling_iteration_query("Sprint 12", Some(start)),
            r#"((Name = "Sprint 12") AND (StartDate = "2026-10-12T06:00:00.000Z"))"#
        );
    }
}
