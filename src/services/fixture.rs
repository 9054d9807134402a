//! In-memory query and entity-search service
//!
//! Serves canned samples with realistic query semantics: rows are selected
//! by event type, narrowed by `=`/`IN` filters found in the query text and
//! faceted by its `FACET` clause. Failures and latency can be injected for
//! exercising the retry and batching paths. Also backs the binary's offline
//! mode through [`FixtureService::demo`].

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::executor::{EntitySearchService, QueryService, TimeSeriesRequest};
use crate::models::{EntityKind, EntityRef, EntitySearchResult, Provider, ResultRow};

type Labels = BTreeMap<String, Vec<String>>;

struct FixtureRow {
    event_type: String,
    labels: Labels,
    age_secs: i64,
    metrics: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Failures {
    always: Option<AppError>,
    next: VecDeque<AppError>,
    matching: Vec<(String, AppError, usize)>,
}

impl Failures {
    /// Failure for a whole call.
    fn call(&mut self) -> Option<AppError> {
        self.always.clone().or_else(|| self.next.pop_front())
    }

    /// Failure for one query inside a call.
    fn query(&mut self, query: &str) -> Option<AppError> {
        let slot = self
            .matching
            .iter_mut()
            .find(|(needle, _, remaining)| *remaining > 0 && query.contains(needle.as_str()))?;
        slot.2 -= 1;
        Some(slot.1.clone())
    }
}

pub struct FixtureService {
    rows: Mutex<Vec<FixtureRow>>,
    entities: Mutex<Vec<EntityRef>>,
    failures: Mutex<Failures>,
    latency: Duration,
    query_calls: AtomicUsize,
    search_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    executed: Mutex<Vec<String>>,
}

impl Default for FixtureService {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureService {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            entities: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::default()),
            latency: Duration::ZERO,
            query_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Delay applied to every call before it answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register one sample row, `age_secs` before now.
    pub fn add_sample(
        &self,
        event_type: &str,
        labels: &[(&str, &str)],
        age_secs: i64,
        metrics: &[(&str, f64)],
    ) {
        self.rows.lock().push(FixtureRow {
            event_type: event_type.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
            age_secs,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        });
    }

    pub fn add_entity(&self, entity: EntityRef) {
        self.entities.lock().push(entity);
    }

    /// Every call fails with `err` until cleared.
    pub fn fail_always(&self, err: AppError) {
        self.failures.lock().always = Some(err);
    }

    /// The next call fails with `err`; queued failures apply in order.
    pub fn fail_next(&self, err: AppError) {
        self.failures.lock().next.push_back(err);
    }

    /// The next `times` queries containing `needle` fail with `err`.
    pub fn fail_matching(&self, needle: &str, err: AppError, times: usize) {
        self.failures
            .lock()
            .matching
            .push((needle.to_string(), err, times));
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = Failures::default();
    }

    /// Round trips made to the query service.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Size of each multi-query round trip, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Query texts received so far, in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn answer(&self, query: &str) -> Result<Vec<ResultRow>> {
        self.executed.lock().push(query.to_string());
        if let Some(err) = self.failures.lock().query(query) {
            return Err(err);
        }

        let facets = facet_fields(query);
        let now = Utc::now();
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .filter(|row| query.contains(row.event_type.as_str()) && matches_labels(query, &row.labels))
            .map(|row| ResultRow {
                facet_values: facets
                    .iter()
                    .map(|field| {
                        row.labels
                            .get(field)
                            .and_then(|values| values.first())
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect(),
                metric_values: row.metrics.clone(),
                timestamp: Some(now - ChronoDuration::seconds(row.age_secs)),
            })
            .collect())
    }

    /// Small healthy deployment used by the offline mode.
    pub fn demo() -> Self {
        let service = Self::new();

        for provider in [Provider::AwsMsk, Provider::ConfluentCloud] {
            for age in [240, 180, 120, 60, 0] {
                let drift = (240 - age) as f64 / 60.0;

                service.add_sample(
                    provider.event_type(EntityKind::Cluster),
                    &[("clusterName", "prod-kafka")],
                    age,
                    &[
                        ("activeControllers", 1.0),
                        ("offlinePartitions", 0.0),
                        ("underReplicatedPartitions", 0.0),
                        ("underMinIsrPartitions", 0.0),
                        ("brokerCount", 3.0),
                        ("topicCount", 2.0),
                        ("bytesInPerSecond", 52_000.0 + 500.0 * drift),
                        ("bytesOutPerSecond", 104_000.0 + 800.0 * drift),
                        ("messagesInPerSecond", 1_200.0 + 10.0 * drift),
                        ("cpuPercent", 42.0 + drift),
                        ("diskUsedPercent", 51.0),
                        ("memoryPercent", 63.0),
                        ("requestHandlerIdlePercent", 78.0),
                        ("produceLatencyMs", 14.0),
                        ("fetchLatencyMs", 22.0),
                    ],
                );
                service.add_sample(
                    provider.event_type(EntityKind::Cluster),
                    &[("clusterName", "staging-kafka")],
                    age,
                    &[
                        ("activeControllers", 1.0),
                        ("offlinePartitions", 0.0),
                        ("underReplicatedPartitions", 3.0),
                        ("underMinIsrPartitions", 0.0),
                        ("brokerCount", 2.0),
                        ("topicCount", 1.0),
                        ("cpuPercent", 81.0 + drift),
                        ("diskUsedPercent", 84.0),
                        ("memoryPercent", 70.0),
                        ("requestHandlerIdlePercent", 35.0),
                        ("produceLatencyMs", 240.0),
                    ],
                );

                for broker in ["1", "2", "3"] {
                    service.add_sample(
                        provider.event_type(EntityKind::Broker),
                        &[("clusterName", "prod-kafka"), ("brokerId", broker)],
                        age,
                        &[
                            ("isController", if broker == "1" { 1.0 } else { 0.0 }),
                            ("offlinePartitions", 0.0),
                            ("underReplicatedPartitions", 0.0),
                            ("bytesInPerSecond", 17_000.0 + 200.0 * drift),
                            ("bytesOutPerSecond", 34_000.0 + 300.0 * drift),
                            ("messagesInPerSecond", 400.0),
                            ("cpuPercent", 40.0 + drift),
                            ("diskUsedPercent", 50.0),
                            ("memoryPercent", 62.0),
                            ("requestHandlerIdlePercent", 80.0),
                            ("networkProcessorIdlePercent", 85.0),
                            ("produceLatencyMs", 12.0),
                            ("fetchLatencyMs", 20.0),
                        ],
                    );
                }

                for (topic, bytes_in) in [("orders", 30_000.0), ("payments", 22_000.0)] {
                    service.add_sample(
                        provider.event_type(EntityKind::Topic),
                        &[("clusterName", "prod-kafka"), ("topic", topic)],
                        age,
                        &[
                            ("partitionCount", 12.0),
                            ("replicationFactor", 3.0),
                            ("offlinePartitions", 0.0),
                            ("underReplicatedPartitions", 0.0),
                            ("bytesInPerSecond", bytes_in + 100.0 * drift),
                            ("messagesInPerSecond", bytes_in / 50.0),
                            ("errorRatePercent", 0.1),
                            ("partitionSkewPercent", 8.0),
                            ("diskUsedPercent", 50.0),
                        ],
                    );
                }

                service.add_sample(
                    provider.event_type(EntityKind::ConsumerGroup),
                    &[
                        ("clusterName", "prod-kafka"),
                        ("consumerGroup", "billing-service"),
                        ("topic", "payments"),
                    ],
                    age,
                    &[
                        ("activeMembers", 4.0),
                        ("totalLag", 150.0 + 5.0 * drift),
                        ("maxLag", 60.0),
                        ("lagGrowthPerSecond", 0.1),
                        ("rebalancesPerHour", 0.0),
                        ("messagesConsumedPerSecond", 440.0),
                    ],
                );
            }

            let mut entities = vec![
                demo_entity(provider, EntityKind::Cluster, "prod-kafka", &[]),
                demo_entity(provider, EntityKind::Cluster, "staging-kafka", &[]),
                demo_entity(
                    provider,
                    EntityKind::ConsumerGroup,
                    "billing-service",
                    &[("clusterName", "prod-kafka"), ("topic", "payments")],
                ),
            ];
            for broker in ["1", "2", "3"] {
                entities.push(demo_entity(
                    provider,
                    EntityKind::Broker,
                    broker,
                    &[("clusterName", "prod-kafka")],
                ));
            }
            for topic in ["orders", "payments"] {
                entities.push(demo_entity(
                    provider,
                    EntityKind::Topic,
                    topic,
                    &[("clusterName", "prod-kafka")],
                ));
            }
            for entity in entities {
                service.add_entity(entity);
            }
        }

        service
    }
}

fn demo_entity(provider: Provider, kind: EntityKind, name: &str, tags: &[(&str, &str)]) -> EntityRef {
    let mut tags: BTreeMap<String, Vec<String>> = tags
        .iter()
        .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
        .collect();
    tags.insert(kind.identity_field().to_string(), vec![name.to_string()]);

    EntityRef {
        guid: format!("DEMO|{}|{}|{}", provider, kind, name),
        name: name.to_string(),
        entity_type: provider.entity_type(kind).to_string(),
        tags,
    }
}

/// Fields named in the query's `FACET` clause.
fn facet_fields(query: &str) -> Vec<String> {
    let Some(start) = query.find(" FACET ") else {
        return Vec::new();
    };
    let rest = &query[start + " FACET ".len()..];
    let end = [" LIMIT ", " SINCE ", " TIMESERIES "]
        .iter()
        .filter_map(|kw| rest.find(kw))
        .min()
        .unwrap_or(rest.len());
    rest[..end]
        .split(", ")
        .map(|field| field.trim_matches('`').to_string())
        .collect()
}

/// A label constrains the match only when the query filters on it.
fn matches_labels(query: &str, labels: &Labels) -> bool {
    labels.iter().all(|(field, values)| {
        let eq = format!("{} = '", field);
        let within = format!("{} IN (", field);

        if let Some(pos) = query.find(&eq) {
            let rest = &query[pos + eq.len()..];
            let wanted = rest.split('\'').next().unwrap_or_default();
            values.iter().any(|v| v == wanted)
        } else if let Some(pos) = query.find(&within) {
            let rest = &query[pos + within.len()..];
            let list = rest.split(')').next().unwrap_or_default();
            values.iter().any(|v| list.contains(&format!("'{}'", v)))
        } else {
            true
        }
    })
}

fn entity_labels(entity: &EntityRef) -> Labels {
    let mut labels: Labels = entity
        .tags
        .iter()
        .map(|(k, v)| (format!("tags.{}", k), v.clone()))
        .collect();
    labels.insert("type".to_string(), vec![entity.entity_type.clone()]);
    labels.insert("id".to_string(), vec![entity.guid.clone()]);
    labels
}

#[async_trait]
impl QueryService for FixtureService {
    async fn run(&self, request: &TimeSeriesRequest) -> Result<Vec<ResultRow>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.failures.lock().call() {
            return Err(err);
        }
        self.answer(&request.query)
    }

    async fn run_batch(
        &self,
        requests: &[TimeSeriesRequest],
    ) -> Result<Vec<Result<Vec<ResultRow>>>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().push(requests.len());
        self.pause().await;
        if let Some(err) = self.failures.lock().call() {
            return Err(err);
        }
        Ok(requests.iter().map(|r| self.answer(&r.query)).collect())
    }
}

#[async_trait]
impl EntitySearchService for FixtureService {
    async fn search(&self, filter_expression: &str) -> Result<EntitySearchResult> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(err) = self.failures.lock().call() {
            return Err(err);
        }
        if let Some(err) = self.failures.lock().query(filter_expression) {
            return Err(err);
        }

        let entities: Vec<EntityRef> = self
            .entities
            .lock()
            .iter()
            .filter(|entity| matches_labels(filter_expression, &entity_labels(entity)))
            .cloned()
            .collect();
        Ok(EntitySearchResult {
            count: entities.len(),
            entities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Aggregation, AggregationOp, Filter, QueryDescriptor, TimeWindow};
    use crate::query::{build, Dialect};

    fn request(query: String) -> TimeSeriesRequest {
        TimeSeriesRequest {
            account_id: 1,
            query,
            window: None,
        }
    }

    #[tokio::test]
    async fn test_demo_filters_and_facets() {
        let service = FixtureService::demo();
        let descriptor = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Broker,
            TimeWindow::last_seconds(300),
        )
        .aggregate(Aggregation::new(AggregationOp::Average, "cpuPercent"))
        .filter(Filter::eq("clusterName", "prod-kafka"))
        .filter(Filter::is_in("brokerId", ["1", "2"]))
        .group_by("brokerId");
        let built = build(&descriptor, Dialect::Nrql).unwrap();

        let rows = service.run(&request(built.text)).await.unwrap();

        assert_eq!(rows.len(), 10);
        assert!(rows
            .iter()
            .all(|r| r.facet_values == vec!["1"] || r.facet_values == vec!["2"]));
    }

    #[tokio::test]
    async fn test_demo_entity_search() {
        let service = FixtureService::demo();
        let expression = "domain IN ('INFRA') AND type = 'AWSMSKTOPIC' AND tags.clusterName = 'prod-kafka'";

        let result = service.search(expression).await.unwrap();

        assert_eq!(result.count, 2);
        assert!(result.entities.iter().all(|e| e.entity_type == "AWSMSKTOPIC"));
    }

    #[tokio::test]
    async fn test_failures_apply_in_order() {
        let service = FixtureService::new();
        service.fail_next(AppError::RateLimited("429".into()));

        assert!(service.run(&request("SELECT 1".into())).await.is_err());
        assert!(service.run(&request("SELECT 1".into())).await.is_ok());
        assert_eq!(service.query_calls(), 2);
    }

    #[test]
    fn test_facet_fields_parsing() {
        assert_eq!(
            facet_fields("SELECT x FROM T FACET a, `b-c` LIMIT 5 SINCE 60 seconds ago"),
            vec!["a", "b-c"]
        );
        assert!(facet_fields("SELECT x FROM T SINCE 60 seconds ago").is_empty());
    }
}
