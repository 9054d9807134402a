//! NerdGraph (GraphQL) client for time-series queries and entity search
//!
//! Several time-series queries share one request through GraphQL aliases
//! (`q0`, `q1`, ...). Errors whose path names an alias fail only that query.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{from_status, AppError, Result};
use crate::executor::{EntitySearchService, QueryService, TimeSeriesRequest};
use crate::models::{EntityRef, EntitySearchResult, ResultRow};

const ENTITY_SEARCH_DOCUMENT: &str = "query($query: String!) { actor { entitySearch(query: $query) { count results { entities { guid name type tags { key values } } } } } }";

/// Keys in a result object that describe the row rather than measure it
const ROW_META_KEYS: &[&str] = &["facet", "beginTimeSeconds", "endTimeSeconds", "timestamp"];

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    path: Vec<Value>,
    #[serde(default)]
    extensions: Option<Value>,
}

impl GraphQlError {
    fn alias(&self) -> Option<&str> {
        self.path
            .iter()
            .filter_map(Value::as_str)
            .find(|segment| alias_index(segment).is_some())
    }

    fn classify(&self) -> AppError {
        let class = self
            .extensions
            .as_ref()
            .and_then(|e| e.get("errorClass"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        classify_message(&format!("{} {}", class, self.message), self.message.clone())
    }
}

fn alias(index: usize) -> String {
    format!("q{}", index)
}

fn alias_index(segment: &str) -> Option<usize> {
    segment.strip_prefix('q')?.parse().ok()
}

/// Map an upstream error message onto the execution error taxonomy.
fn classify_message(haystack: &str, message: String) -> AppError {
    let lower = haystack.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        AppError::Timeout(Duration::ZERO)
    } else if lower.contains("rate limit") || lower.contains("too_many_requests") || lower.contains("too many") {
        AppError::RateLimited(message)
    } else if lower.contains("forbidden")
        || lower.contains("unauthorized")
        || lower.contains("permission")
        || lower.contains("access denied")
    {
        AppError::PermissionDenied(message)
    } else if lower.contains("unavailable") || lower.contains("internal server") {
        AppError::ServiceUnavailable(message)
    } else {
        AppError::InvalidQuery(message)
    }
}

/// GraphQL document running `count` time-series queries under aliases.
fn nrql_document(count: usize) -> String {
    let params: Vec<String> = (0..count).map(|i| format!("${}: Nrql!", alias(i))).collect();
    let fields: Vec<String> = (0..count)
        .map(|i| format!("{a}: nrql(query: ${a}) {{ results }}", a = alias(i)))
        .collect();
    format!(
        "query($accountId: Int!, {}) {{ actor {{ account(id: $accountId) {{ {} }} }} }}",
        params.join(", "),
        fields.join(" ")
    )
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // percentile(...) and similar come back as {"95": 12.5}
        Value::Object(map) => map.values().find_map(Value::as_f64),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Flatten one NRQL result object into a row.
fn row_from_object(object: &Map<String, Value>) -> ResultRow {
    let facet_values = match object.get("facet") {
        Some(Value::Array(values)) => values.iter().map(text).collect(),
        Some(value) => vec![text(value)],
        None => Vec::new(),
    };

    let timestamp = object
        .get("beginTimeSeconds")
        .and_then(Value::as_f64)
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
        .or_else(|| {
            object
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        });

    let metric_values: BTreeMap<String, f64> = object
        .iter()
        .filter(|(key, _)| !ROW_META_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| number(value).map(|n| (key.clone(), n)))
        .collect();

    ResultRow {
        facet_values,
        metric_values,
        timestamp,
    }
}

fn rows_from(value: &Value) -> Result<Vec<ResultRow>> {
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::InternalError("query result has no 'results' array".into()))?;
    Ok(results
        .iter()
        .filter_map(Value::as_object)
        .map(row_from_object)
        .collect())
}

/// Split a batched response into per-query results.
fn batch_results(response: GraphQlResponse, count: usize) -> Result<Vec<Result<Vec<ResultRow>>>> {
    let mut item_errors: BTreeMap<usize, AppError> = BTreeMap::new();
    let mut call_errors = Vec::new();
    for error in &response.errors {
        match error.alias().and_then(alias_index) {
            Some(index) if index < count => {
                item_errors.entry(index).or_insert_with(|| error.classify());
            }
            _ => call_errors.push(error),
        }
    }

    let account = response
        .data
        .as_ref()
        .and_then(|d| d.pointer("/actor/account"))
        .filter(|a| !a.is_null());
    let Some(account) = account else {
        return Err(match call_errors.first().copied().or(response.errors.first()) {
            Some(error) => error.classify(),
            None => AppError::InternalError("response carried neither data nor errors".into()),
        });
    };
    if let Some(error) = call_errors.first() {
        warn!(error = %error.message, "NerdGraph reported an error outside any query");
    }

    Ok((0..count)
        .map(|index| {
            if let Some(err) = item_errors.remove(&index) {
                return Err(err);
            }
            match account.get(alias(index)) {
                Some(value) if !value.is_null() => rows_from(value),
                _ => Err(AppError::InternalError(format!(
                    "no result for query {}",
                    index
                ))),
            }
        })
        .collect())
}

fn entities_from(response: GraphQlResponse) -> Result<EntitySearchResult> {
    let search = response
        .data
        .as_ref()
        .and_then(|d| d.pointer("/actor/entitySearch"))
        .filter(|s| !s.is_null());
    let Some(search) = search else {
        return Err(match response.errors.first() {
            Some(error) => error.classify(),
            None => AppError::InternalError("entity search returned no data".into()),
        });
    };

    let entities: Vec<EntityRef> = search
        .pointer("/results/entities")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|entity| {
                    let tags = entity
                        .get("tags")
                        .and_then(Value::as_array)
                        .map(|tags| {
                            tags.iter()
                                .filter_map(|tag| {
                                    let key = tag.get("key")?.as_str()?.to_string();
                                    let values = tag
                                        .get("values")?
                                        .as_array()?
                                        .iter()
                                        .map(text)
                                        .collect::<Vec<String>>();
                                    Some((key, values))
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    EntityRef {
                        guid: entity.get("guid").map(text).unwrap_or_default(),
                        name: entity.get("name").map(text).unwrap_or_default(),
                        entity_type: entity.get("type").map(text).unwrap_or_default(),
                        tags,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let count = search
        .get("count")
        .and_then(Value::as_u64)
        .map_or(entities.len(), |c| c as usize);
    Ok(EntitySearchResult { count, entities })
}

/// HTTP client for the NerdGraph API
pub struct NerdGraphClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl NerdGraphClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    async fn post(&self, document: &str, variables: Value) -> Result<GraphQlResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("API-Key", &self.api_key)
            .json(&json!({ "query": document, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(from_status(status.as_u16(), format!("NerdGraph returned {}: {}", status, body)));
        }

        Ok(response.json::<GraphQlResponse>().await?)
    }
}

#[async_trait]
impl QueryService for NerdGraphClient {
    async fn run(&self, request: &TimeSeriesRequest) -> Result<Vec<ResultRow>> {
        self.run_batch(std::slice::from_ref(request))
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(AppError::InternalError("empty batch response".into())))
    }

    async fn run_batch(
        &self,
        requests: &[TimeSeriesRequest],
    ) -> Result<Vec<Result<Vec<ResultRow>>>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        if requests.iter().any(|r| r.account_id != first.account_id) {
            return Err(AppError::InternalError(
                "batched queries must target one account".into(),
            ));
        }

        let mut variables = Map::new();
        variables.insert("accountId".to_string(), json!(first.account_id));
        for (index, request) in requests.iter().enumerate() {
            variables.insert(alias(index), json!(request.query));
        }

        debug!(queries = requests.len(), "Sending NRQL batch to NerdGraph");
        let response = self
            .post(&nrql_document(requests.len()), Value::Object(variables))
            .await?;
        batch_results(response, requests.len())
    }
}

#[async_trait]
impl EntitySearchService for NerdGraphClient {
    async fn search(&self, filter_expression: &str) -> Result<EntitySearchResult> {
        debug!(query = %filter_expression, "Sending entity search to NerdGraph");
        let response = self
            .post(ENTITY_SEARCH_DOCUMENT, json!({ "query": filter_expression }))
            .await?;
        entities_from(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: Value) -> GraphQlResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_nrql_document_aliases_each_query() {
        assert_eq!(
            nrql_document(2),
            "query($accountId: Int!, $q0: Nrql!, $q1: Nrql!) { actor { account(id: $accountId) { \
             q0: nrql(query: $q0) { results } q1: nrql(query: $q1) { results } } } }"
        );
    }

    #[test]
    fn test_row_flattening() {
        let object = json!({
            "facet": ["prod-kafka", "1"],
            "beginTimeSeconds": 1700000000,
            "endTimeSeconds": 1700000060,
            "cpu": 41.5,
            "p95": {"95": 12.0},
            "clusterName": "prod-kafka"
        });
        let row = row_from_object(object.as_object().unwrap());

        assert_eq!(row.facet_values, vec!["prod-kafka", "1"]);
        assert_eq!(row.timestamp.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(row.metric_values.len(), 2);
        assert_eq!(row.metric_values["cpu"], 41.5);
        assert_eq!(row.metric_values["p95"], 12.0);
    }

    #[test]
    fn test_item_error_fails_only_its_query() {
        let body = response(json!({
            "data": {"actor": {"account": {
                "q0": {"results": [{"count": 3}]},
                "q1": null
            }}},
            "errors": [{"message": "NRQL Syntax Error: Error at line 1", "path": ["actor", "account", "q1"]}]
        }));

        let results = batch_results(body, 2).unwrap();

        assert_eq!(results[0].as_ref().unwrap()[0].metric_values["count"], 3.0);
        assert!(matches!(results[1], Err(AppError::InvalidQuery(_))));
    }

    #[test]
    fn test_call_error_without_data_fails_batch() {
        let body = response(json!({
            "data": null,
            "errors": [{"message": "Too many requests", "extensions": {"errorClass": "TOO_MANY_REQUESTS"}}]
        }));
        assert!(matches!(batch_results(body, 2), Err(AppError::RateLimited(_))));
    }

    #[test]
    fn test_message_classification() {
        assert!(matches!(
            classify_message("NRQL query timed out", String::new()),
            AppError::Timeout(_)
        ));
        assert!(matches!(
            classify_message("FORBIDDEN access denied", String::new()),
            AppError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_message("Service unavailable", String::new()),
            AppError::ServiceUnavailable(_)
        ));
    }

    #[test]
    fn test_entity_search_parsing() {
        let body = response(json!({
            "data": {"actor": {"entitySearch": {
                "count": 1,
                "results": {"entities": [{
                    "guid": "MXxJTkZSQXww",
                    "name": "prod-kafka",
                    "type": "AWSMSKCLUSTER",
                    "tags": [{"key": "clusterName", "values": ["prod-kafka"]}]
                }]}
            }}}
        }));

        let result = entities_from(body).unwrap();

        assert_eq!(result.count, 1);
        assert_eq!(result.entities[0].guid, "MXxJTkZSQXww");
        assert_eq!(result.entities[0].tags["clusterName"], vec!["prod-kafka"]);
    }
}
