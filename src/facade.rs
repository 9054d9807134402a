//! Orchestration facade: the single entry point for metric and entity views
//!
//! Request flow: descriptor, build, cache read, then on a miss the batch
//! coordinator hands the query to a [`Pipeline`] that executes, aggregates,
//! scores health and writes the cache before subscribers are released.

use async_trait::async_trait;
use chrono::Utc;
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::aggregator::{aggregate_rows, AggregatedResult};
use crate::batch::{BatchConfig, BatchCoordinator, BatchExecutor, CoordinatorStatsSnapshot};
use crate::cache::{CacheStatsSnapshot, ResultCache};
use crate::error::{AppError, Result};
use crate::executor::{ExecutorStatsSnapshot, QueryExecutor};
use crate::health::{HealthCalculator, HealthFactors};
use crate::models::{
    Aggregation, AggregationKind, AggregationOp, EntityKind, EntityQuery, EntitySearchResult,
    Filter, FilterOp, FilterValue, MetricRequest, MetricSpec, Provider, QueryDescriptor,
    RawResult, TimeWindow,
};
use crate::query::{build, BuiltQuery, Dialect};

/// Entity searches are not time-bound; the window only satisfies validation
const ENTITY_SEARCH_WINDOW_SECS: i64 = 3600;

/// Smallest bucket used when a series is requested without an explicit size
const MIN_SERIES_BUCKET_SECS: u64 = 60;

/// Buckets a window is split into for series aggregations
const SERIES_BUCKETS: u64 = 30;

/// Cache lifetimes by data volatility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Entity lists change rarely
    pub topology: Duration,
    /// Metric views go stale quickly
    pub metrics: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            topology: Duration::from_secs(300),
            metrics: Duration::from_secs(30),
        }
    }
}

/// What a caller sees for one request
#[derive(Debug, Clone)]
pub struct FetchState<T> {
    pub loading: bool,
    pub error: Option<AppError>,
    /// Shared with the cache; identical across calls while the entry lives
    pub data: Option<Arc<T>>,
}

impl<T> FetchState<T> {
    pub fn ready(data: Arc<T>) -> Self {
        Self {
            loading: false,
            error: None,
            data: Some(data),
        }
    }

    pub fn failed(error: AppError) -> Self {
        Self {
            loading: false,
            error: Some(error),
            data: None,
        }
    }

    pub fn pending() -> Self {
        Self {
            loading: true,
            error: None,
            data: None,
        }
    }

    pub fn into_result(self) -> Result<Arc<T>> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Err(AppError::InternalError("result still loading".into())),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
}

impl<T: Serialize> Serialize for FetchState<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FetchState", 3)?;
        state.serialize_field("loading", &self.loading)?;
        state.serialize_field(
            "error",
            &self.error.as_ref().map(|e| ErrorBody {
                kind: e.kind(),
                message: e.to_string(),
            }),
        )?;
        state.serialize_field("data", &self.data.as_deref())?;
        state.end()
    }
}

/// Values held in the facade's cache
#[derive(Debug, Clone)]
pub enum CachedValue {
    Metrics(Arc<AggregatedResult>),
    Entities(Arc<EntitySearchResult>),
}

#[derive(Debug, Clone)]
enum Finish {
    Metrics {
        kind: EntityKind,
        metrics: Vec<MetricSpec>,
        include_health: bool,
    },
    Entities,
}

/// A built query plus what to do with its result
#[derive(Debug, Clone)]
pub struct PendingQuery {
    built: BuiltQuery,
    finish: Finish,
    ttl: Duration,
    depends_on: Vec<String>,
    tags: Vec<String>,
    /// cache generation when the miss was observed
    since: u64,
}

/// Executes a closed batch, then aggregates and caches each result.
struct Pipeline {
    executor: Arc<QueryExecutor>,
    cache: Arc<ResultCache<CachedValue>>,
    health: Arc<HealthCalculator>,
}

impl Pipeline {
    fn finish(&self, pending: &PendingQuery, raw: RawResult) -> Result<CachedValue> {
        match (&pending.finish, raw) {
            (
                Finish::Metrics {
                    kind,
                    metrics,
                    include_health,
                },
                RawResult::Rows(rows),
            ) => {
                let local: Vec<MetricSpec> = metrics.iter().map(local_spec).collect();
                let mut result = aggregate_rows(&rows, &local, Utc::now());
                if *include_health {
                    for group in &mut result.groups {
                        let factors = HealthFactors::from_metrics(*kind, &group.metrics);
                        group.health = Some(self.health.score(&factors));
                    }
                }
                Ok(CachedValue::Metrics(Arc::new(result)))
            }
            (Finish::Entities, RawResult::Entities(entities)) => {
                Ok(CachedValue::Entities(Arc::new(entities)))
            }
            _ => Err(AppError::InternalError(format!(
                "result shape does not match query {}",
                pending.built.cache_key
            ))),
        }
    }

    fn store(&self, key: &str, pending: &PendingQuery, value: &CachedValue) {
        let mut tags = pending.tags.clone();
        if let CachedValue::Entities(entities) = value {
            tags.extend(entities.entities.iter().map(|e| e.guid.clone()));
        }

        match self.cache.set_unless_invalidated(
            pending.since,
            key,
            value.clone(),
            pending.ttl,
            pending.depends_on.iter().cloned(),
            tags,
        ) {
            Ok(true) => {}
            Ok(false) => debug!(key = %key, "Result invalidated while in flight, not cached"),
            Err(e) => warn!(key = %key, error = %e, "Result not cached"),
        }
    }
}

#[async_trait]
impl BatchExecutor<PendingQuery, CachedValue> for Pipeline {
    async fn execute_batch(
        &self,
        requests: Vec<(String, PendingQuery)>,
    ) -> Result<HashMap<String, Result<CachedValue>>> {
        let queries: Vec<BuiltQuery> = requests.iter().map(|(_, p)| p.built.clone()).collect();
        let raw = self.executor.execute_batch(&queries).await?;

        Ok(requests
            .into_iter()
            .zip(raw)
            .map(|((key, pending), raw)| {
                let value = raw.and_then(|raw| self.finish(&pending, raw));
                if let Ok(value) = &value {
                    self.store(&key, &pending, value);
                }
                (key, value)
            })
            .collect())
    }
}

/// Server-side operation that feeds a local aggregation.
fn server_op(kind: AggregationKind) -> AggregationOp {
    match kind {
        AggregationKind::Sum => AggregationOp::Sum,
        AggregationKind::Average => AggregationOp::Average,
        AggregationKind::Min => AggregationOp::Min,
        AggregationKind::Max => AggregationOp::Max,
        AggregationKind::Count => AggregationOp::Count,
        AggregationKind::Percentile { p } => AggregationOp::Percentile { p },
        AggregationKind::Latest
        | AggregationKind::Rate
        | AggregationKind::Histogram { .. }
        | AggregationKind::Trend => AggregationOp::Latest,
    }
}

/// Local roll-up over the server's per-row values; server counts are summed.
fn local_spec(metric: &MetricSpec) -> MetricSpec {
    let kind = match metric.aggregation.kind {
        AggregationKind::Count => AggregationKind::Sum,
        other => other,
    };
    MetricSpec::new(metric.name.clone(), kind, metric.aggregation.field.clone())
}

fn needs_series(kind: AggregationKind) -> bool {
    matches!(
        kind,
        AggregationKind::Rate | AggregationKind::Trend | AggregationKind::Histogram { .. }
    )
}

/// Tags for every entry derived from these filters.
fn scope_tags(kind: EntityKind, filters: &[Filter]) -> Vec<String> {
    let mut tags = vec![format!("kind:{}", kind)];
    for filter in filters.iter().filter(|f| f.field == "clusterName") {
        match (filter.op, &filter.value) {
            (FilterOp::Eq, FilterValue::Text(name)) => tags.push(format!("cluster:{}", name)),
            (FilterOp::In, FilterValue::List(names)) => {
                tags.extend(names.iter().filter_map(|v| match v {
                    FilterValue::Text(name) => Some(format!("cluster:{}", name)),
                    _ => None,
                }))
            }
            _ => {}
        }
    }
    tags
}

/// Public entry point for metric and entity views
pub struct MetricsOrchestrator {
    provider: Provider,
    cache: Arc<ResultCache<CachedValue>>,
    coordinator: BatchCoordinator<PendingQuery, CachedValue>,
    pipeline: Arc<Pipeline>,
    ttl: TtlPolicy,
}

impl MetricsOrchestrator {
    pub fn new(
        provider: Provider,
        cache: Arc<ResultCache<CachedValue>>,
        executor: Arc<QueryExecutor>,
        health: HealthCalculator,
        batch: BatchConfig,
        ttl: TtlPolicy,
    ) -> Self {
        let pipeline = Arc::new(Pipeline {
            executor,
            cache: Arc::clone(&cache),
            health: Arc::new(health),
        });
        Self {
            provider,
            cache,
            coordinator: BatchCoordinator::new(batch),
            pipeline,
            ttl,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Descriptor behind a metric request; one aliased column per metric.
    pub fn descriptor_for(&self, request: &MetricRequest) -> Result<QueryDescriptor> {
        if request.metrics.is_empty() {
            return Err(AppError::InvalidDescriptor(
                "metric request names no metrics".into(),
            ));
        }
        let mut names = HashSet::new();
        if let Some(metric) = request.metrics.iter().find(|m| !names.insert(m.name.as_str())) {
            return Err(AppError::InvalidDescriptor(format!(
                "metric name '{}' used twice",
                metric.name
            )));
        }

        let mut descriptor =
            QueryDescriptor::new(self.provider, request.entity_kind, request.time_range);
        descriptor.filters = request.filters.clone();
        if !request.entity_guids.is_empty() {
            descriptor = descriptor.filter(Filter::is_in(
                "entityGuid",
                request.entity_guids.iter().cloned(),
            ));
        }
        descriptor.group_by = request.group_by.clone();
        descriptor.limit = request.limit;

        for metric in &request.metrics {
            let aggregation = Aggregation::new(
                server_op(metric.aggregation.kind),
                metric.aggregation.field.clone(),
            )
            .with_alias(metric.name.clone());
            descriptor = descriptor.aggregate(aggregation);
        }

        descriptor.timeseries_secs = request.timeseries_secs.or_else(|| {
            request
                .metrics
                .iter()
                .any(|m| needs_series(m.aggregation.kind))
                .then(|| {
                    let window = request.time_range.duration_secs().max(0) as u64;
                    (window / SERIES_BUCKETS).max(MIN_SERIES_BUCKET_SECS)
                })
        });

        Ok(descriptor)
    }

    fn built_metric(&self, request: &MetricRequest) -> Result<(BuiltQuery, String)> {
        let built = build(&self.descriptor_for(request)?, Dialect::Nrql)?;

        // the query key alone does not capture the local roll-up
        let mut metrics: Vec<&MetricSpec> = request.metrics.iter().collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        let mut hasher = DefaultHasher::new();
        metrics.hash(&mut hasher);
        request.include_health.hash(&mut hasher);

        let key = format!("{}:{:016x}", built.cache_key, hasher.finish());
        Ok((built, key))
    }

    /// Cache key under which a metric request's result is stored.
    pub fn metric_key(&self, request: &MetricRequest) -> Result<String> {
        self.built_metric(request).map(|(_, key)| key)
    }

    /// Serve a metric view from cache, or execute it.
    pub async fn fetch_metrics(&self, request: &MetricRequest) -> FetchState<AggregatedResult> {
        match self.try_fetch_metrics(request).await {
            Ok(data) => FetchState::ready(data),
            Err(e) => {
                debug!(kind = %request.entity_kind, error = %e, "Metric request failed");
                FetchState::failed(e)
            }
        }
    }

    async fn try_fetch_metrics(&self, request: &MetricRequest) -> Result<Arc<AggregatedResult>> {
        let (built, key) = self.built_metric(request)?;

        let since = self.cache.generation();
        if let Some(entry) = self.cache.get(&key) {
            if let CachedValue::Metrics(data) = entry.value {
                debug!(key = %key, "Metric cache hit");
                return Ok(data);
            }
        }
        debug!(key = %key, "Metric cache miss");

        let mut tags = scope_tags(request.entity_kind, &request.filters);
        tags.extend(request.entity_guids.iter().cloned());
        let pending = PendingQuery {
            finish: Finish::Metrics {
                kind: request.entity_kind,
                metrics: request.metrics.clone(),
                include_health: request.include_health,
            },
            ttl: request
                .ttl_secs
                .map_or(self.ttl.metrics, Duration::from_secs),
            depends_on: request.depends_on.clone(),
            tags,
            since,
            built,
        };

        match self.dispatch(&key, pending).await? {
            CachedValue::Metrics(data) => Ok(data),
            CachedValue::Entities(_) => Err(AppError::InternalError(format!(
                "key {} holds an entity list",
                key
            ))),
        }
    }

    /// Current cached state of a metric request, without executing anything.
    pub fn cached_metrics(&self, request: &MetricRequest) -> FetchState<AggregatedResult> {
        let key = match self.metric_key(request) {
            Ok(key) => key,
            Err(e) => return FetchState::failed(e),
        };
        match self.cache.get(&key).map(|entry| entry.value) {
            Some(CachedValue::Metrics(data)) => FetchState::ready(data),
            _ => FetchState::pending(),
        }
    }

    fn built_entities(&self, query: &EntityQuery) -> Result<BuiltQuery> {
        let mut descriptor = QueryDescriptor::new(
            self.provider,
            query.entity_kind,
            TimeWindow::last_seconds(ENTITY_SEARCH_WINDOW_SECS),
        )
        .aggregate(Aggregation::new(AggregationOp::Count, "*"));
        descriptor.filters = query.filters.clone();
        build(&descriptor, Dialect::EntitySearch)
    }

    /// Cache key of an entity lookup; metric requests list it in `depends_on`.
    pub fn entities_key(&self, query: &EntityQuery) -> Result<String> {
        self.built_entities(query).map(|built| built.cache_key)
    }

    /// Serve an entity list from cache, or search for it.
    pub async fn fetch_entities(&self, query: &EntityQuery) -> FetchState<EntitySearchResult> {
        match self.try_fetch_entities(query).await {
            Ok(data) => FetchState::ready(data),
            Err(e) => {
                debug!(kind = %query.entity_kind, error = %e, "Entity request failed");
                FetchState::failed(e)
            }
        }
    }

    async fn try_fetch_entities(&self, query: &EntityQuery) -> Result<Arc<EntitySearchResult>> {
        let built = self.built_entities(query)?;
        let key = built.cache_key.clone();

        let since = self.cache.generation();
        if let Some(entry) = self.cache.get(&key) {
            if let CachedValue::Entities(data) = entry.value {
                debug!(key = %key, "Entity cache hit");
                return Ok(data);
            }
        }

        let pending = PendingQuery {
            finish: Finish::Entities,
            ttl: query.ttl_secs.map_or(self.ttl.topology, Duration::from_secs),
            depends_on: Vec::new(),
            tags: scope_tags(query.entity_kind, &query.filters),
            since,
            built,
        };

        match self.dispatch(&key, pending).await? {
            CachedValue::Entities(data) => Ok(data),
            CachedValue::Metrics(_) => Err(AppError::InternalError(format!(
                "key {} holds a metric view",
                key
            ))),
        }
    }

    async fn dispatch(&self, key: &str, pending: PendingQuery) -> Result<CachedValue> {
        let group = pending.built.batch_group();
        let executor: Arc<dyn BatchExecutor<PendingQuery, CachedValue>> = self.pipeline.clone();
        self.coordinator
            .schedule_batch(&group, key, pending, executor)
            .await
    }

    /// Topology-change hook: drop everything derived from `tag`.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        self.cache.invalidate_by_tag(tag)
    }

    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        self.cache.invalidate_by_tags(tags)
    }

    pub fn invalidate(&self, key: &str) -> usize {
        self.cache.invalidate(key)
    }

    /// Drop expired entries; run periodically by the sweeper task.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn coordinator_stats(&self) -> CoordinatorStatsSnapshot {
        self.coordinator.stats()
    }

    pub fn executor_stats(&self) -> ExecutorStatsSnapshot {
        self.pipeline.executor.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RetryPolicy;
    use crate::health::HealthStatus;
    use crate::services::FixtureService;

    fn orchestrator(service: Arc<FixtureService>) -> MetricsOrchestrator {
        let executor = Arc::new(QueryExecutor::new(
            service.clone(),
            service,
            RetryPolicy::default(),
            1,
        ));
        MetricsOrchestrator::new(
            Provider::AwsMsk,
            Arc::new(ResultCache::new(100)),
            executor,
            HealthCalculator::new(),
            BatchConfig::default(),
            TtlPolicy::default(),
        )
    }

    fn cpu_request() -> MetricRequest {
        MetricRequest::new(EntityKind::Broker, TimeWindow::last_seconds(300))
            .metric(MetricSpec::new("cpu", AggregationKind::Average, "cpuPercent"))
            .filter(Filter::eq("clusterName", "prod-kafka"))
            .group_by("brokerId")
    }

    #[test]
    fn test_descriptor_mapping() {
        let facade = orchestrator(Arc::new(FixtureService::new()));
        let request = cpu_request().metric(MetricSpec::new(
            "bytesRate",
            AggregationKind::Rate,
            "bytesInPerSecond",
        ));

        let descriptor = facade.descriptor_for(&request).unwrap();

        assert_eq!(descriptor.aggregations.len(), 2);
        assert_eq!(descriptor.aggregations[1].op, AggregationOp::Latest);
        assert_eq!(descriptor.aggregations[1].alias.as_deref(), Some("bytesRate"));
        assert_eq!(descriptor.timeseries_secs, Some(60));
    }

    #[test]
    fn test_duplicate_metric_names_rejected() {
        let facade = orchestrator(Arc::new(FixtureService::new()));
        let request = cpu_request().metric(MetricSpec::new("cpu", AggregationKind::Max, "cpuPercent"));
        assert!(matches!(
            facade.descriptor_for(&request),
            Err(AppError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_metric_key_reflects_local_rollup() {
        let facade = orchestrator(Arc::new(FixtureService::new()));
        let latest = MetricRequest::new(EntityKind::Broker, TimeWindow::last_seconds(300))
            .metric(MetricSpec::new("bytes", AggregationKind::Latest, "bytesInPerSecond"));
        let mut trend = latest.clone();
        trend.metrics[0].aggregation.kind = AggregationKind::Trend;
        trend.timeseries_secs = Some(60);
        let mut latest_series = latest.clone();
        latest_series.timeseries_secs = Some(60);

        assert_ne!(
            facade.metric_key(&latest_series).unwrap(),
            facade.metric_key(&trend).unwrap()
        );
        assert_eq!(
            facade.metric_key(&latest).unwrap(),
            facade.metric_key(&latest.clone()).unwrap()
        );
    }

    #[test]
    fn test_scope_tags() {
        let tags = scope_tags(
            EntityKind::Topic,
            &[Filter::is_in("clusterName", ["a", "b"]), Filter::eq("topic", "orders")],
        );
        assert_eq!(tags, vec!["kind:topic", "cluster:a", "cluster:b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_metrics_groups_by_facet() {
        let service = Arc::new(FixtureService::demo());
        let facade = orchestrator(service.clone());

        let data = facade.fetch_metrics(&cpu_request()).await.into_result().unwrap();

        assert_eq!(data.groups.len(), 3);
        let broker = data.group(&["2"]).unwrap();
        assert_eq!(broker.sample_count, 5);
        assert_eq!(broker.metrics["cpu"].as_value(), Some(42.0));
        assert!(broker.health.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_is_attached_per_group() {
        let service = Arc::new(FixtureService::demo());
        let facade = orchestrator(service);
        let request = crate::health::health_request(EntityKind::Topic, TimeWindow::last_seconds(300))
            .filter(Filter::eq("clusterName", "prod-kafka"))
            .group_by("topic");

        let data = facade.fetch_metrics(&request).await.into_result().unwrap();

        assert_eq!(data.groups.len(), 2);
        for group in &data.groups {
            let health = group.health.as_ref().unwrap();
            assert_eq!(health.status, HealthStatus::Excellent);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_metrics_peek() {
        let service = Arc::new(FixtureService::demo());
        let facade = orchestrator(service);
        let request = cpu_request();

        let before = facade.cached_metrics(&request);
        assert!(before.loading);
        assert!(before.data.is_none());

        let fetched = facade.fetch_metrics(&request).await;
        let after = facade.cached_metrics(&request);
        assert!(!after.loading);
        assert!(Arc::ptr_eq(
            fetched.data.as_ref().unwrap(),
            after.data.as_ref().unwrap()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_results_are_tagged_with_guids() {
        let service = Arc::new(FixtureService::demo());
        let facade = orchestrator(service.clone());
        let query = EntityQuery::new(EntityKind::Topic).filter(Filter::eq("clusterName", "prod-kafka"));

        let entities = facade.fetch_entities(&query).await.into_result().unwrap();
        assert_eq!(entities.count, 2);

        let guid = entities.entities[0].guid.clone();
        assert_eq!(facade.invalidate_by_tag(&guid), 1);
        facade.fetch_entities(&query).await.into_result().unwrap();
        assert_eq!(service.search_calls(), 2);
    }

    #[test]
    fn test_fetch_state_serialization() {
        let failed: FetchState<u32> = FetchState::failed(AppError::RateLimited("slow".into()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["loading"], false);
        assert_eq!(json["error"]["kind"], "rate_limited");
        assert!(json["data"].is_null());

        let ready = FetchState::ready(Arc::new(5u32));
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["data"], 5);
        assert!(json["error"].is_null());
    }
}
