//! Core domain models for kafka-lens

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Kind of Kafka entity a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Cluster,
    Broker,
    Topic,
    ConsumerGroup,
}

const CLUSTER_FIELDS: &[&str] = &[
    "entityGuid",
    "clusterName",
    "accountId",
    "activeControllers",
    "offlinePartitions",
    "underReplicatedPartitions",
    "underMinIsrPartitions",
    "brokerCount",
    "topicCount",
    "bytesInPerSecond",
    "bytesOutPerSecond",
    "messagesInPerSecond",
    "cpuPercent",
    "diskUsedPercent",
    "memoryPercent",
    "requestHandlerIdlePercent",
    "produceLatencyMs",
    "fetchLatencyMs",
];

const BROKER_FIELDS: &[&str] = &[
    "entityGuid",
    "clusterName",
    "brokerId",
    "isController",
    "underReplicatedPartitions",
    "offlinePartitions",
    "bytesInPerSecond",
    "bytesOutPerSecond",
    "messagesInPerSecond",
    "cpuPercent",
    "diskUsedPercent",
    "memoryPercent",
    "requestHandlerIdlePercent",
    "networkProcessorIdlePercent",
    "produceLatencyMs",
    "fetchLatencyMs",
];

const TOPIC_FIELDS: &[&str] = &[
    "entityGuid",
    "clusterName",
    "topic",
    "partitionCount",
    "replicationFactor",
    "offlinePartitions",
    "underReplicatedPartitions",
    "bytesInPerSecond",
    "bytesOutPerSecond",
    "messagesInPerSecond",
    "errorRatePercent",
    "partitionSkewPercent",
    "diskUsedPercent",
];

const CONSUMER_GROUP_FIELDS: &[&str] = &[
    "entityGuid",
    "clusterName",
    "consumerGroup",
    "topic",
    "activeMembers",
    "totalLag",
    "maxLag",
    "lagGrowthPerSecond",
    "rebalancesPerHour",
    "messagesConsumedPerSecond",
];

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Cluster,
        EntityKind::Broker,
        EntityKind::Topic,
        EntityKind::ConsumerGroup,
    ];

    /// Attributes that may be filtered, grouped or aggregated on.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Cluster => CLUSTER_FIELDS,
            EntityKind::Broker => BROKER_FIELDS,
            EntityKind::Topic => TOPIC_FIELDS,
            EntityKind::ConsumerGroup => CONSUMER_GROUP_FIELDS,
        }
    }

    pub fn has_field(self, field: &str) -> bool {
        self.fields().contains(&field)
    }

    /// Attribute that names one entity of this kind.
    pub fn identity_field(self) -> &'static str {
        match self {
            EntityKind::Cluster => "clusterName",
            EntityKind::Broker => "brokerId",
            EntityKind::Topic => "topic",
            EntityKind::ConsumerGroup => "consumerGroup",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Cluster => "cluster",
            EntityKind::Broker => "broker",
            EntityKind::Topic => "topic",
            EntityKind::ConsumerGroup => "consumerGroup",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kafka hosting provider; decides event and entity type names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    AwsMsk,
    ConfluentCloud,
}

impl Provider {
    /// Event type queried in the time-series dialect.
    pub fn event_type(self, kind: EntityKind) -> &'static str {
        match (self, kind) {
            (Provider::AwsMsk, EntityKind::Cluster) => "AwsMskClusterSample",
            (Provider::AwsMsk, EntityKind::Broker) => "AwsMskBrokerSample",
            (Provider::AwsMsk, EntityKind::Topic) => "AwsMskTopicSample",
            (Provider::AwsMsk, EntityKind::ConsumerGroup) => "KafkaOffsetSample",
            (Provider::ConfluentCloud, EntityKind::Cluster) => "ConfluentCloudClusterSample",
            (Provider::ConfluentCloud, EntityKind::Broker) => "ConfluentCloudBrokerSample",
            (Provider::ConfluentCloud, EntityKind::Topic) => "ConfluentCloudTopicSample",
            (Provider::ConfluentCloud, EntityKind::ConsumerGroup) => {
                "ConfluentCloudConsumerGroupSample"
            }
        }
    }

    /// Entity type used by the entity-search dialect.
    pub fn entity_type(self, kind: EntityKind) -> &'static str {
        match (self, kind) {
            (Provider::AwsMsk, EntityKind::Cluster) => "AWSMSKCLUSTER",
            (Provider::AwsMsk, EntityKind::Broker) => "AWSMSKBROKER",
            (Provider::AwsMsk, EntityKind::Topic) => "AWSMSKTOPIC",
            (Provider::AwsMsk, EntityKind::ConsumerGroup) => "KAFKACONSUMERGROUP",
            (Provider::ConfluentCloud, EntityKind::Cluster) => "CONFLUENTCLOUDCLUSTER",
            (Provider::ConfluentCloud, EntityKind::Broker) => "CONFLUENTCLOUDBROKER",
            (Provider::ConfluentCloud, EntityKind::Topic) => "CONFLUENTCLOUDKAFKATOPIC",
            (Provider::ConfluentCloud, EntityKind::ConsumerGroup) => {
                "CONFLUENTCLOUDCONSUMERGROUP"
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::AwsMsk => "aws_msk",
            Provider::ConfluentCloud => "confluent_cloud",
        }
    }
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws_msk" | "msk" => Ok(Provider::AwsMsk),
            "confluent_cloud" | "confluent" => Ok(Provider::ConfluentCloud),
            other => Err(AppError::InvalidRequest(format!("Unknown provider '{}'", other))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side aggregation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum AggregationOp {
    Sum,
    Average,
    Min,
    Max,
    Count,
    Latest,
    UniqueCount,
    Percentile { p: u8 },
    Rate { per_secs: u32 },
    Histogram { buckets: u16 },
}

/// One aggregation in a descriptor's select list
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(flatten)]
    pub op: AggregationOp,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(op: AggregationOp, field: impl Into<String>) -> Self {
        Self {
            op,
            field: field.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Column name this aggregation produces.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => format!("{}.{}", op_name(&self.op), self.field),
        }
    }
}

fn op_name(op: &AggregationOp) -> &'static str {
    match op {
        AggregationOp::Sum => "sum",
        AggregationOp::Average => "average",
        AggregationOp::Min => "min",
        AggregationOp::Max => "max",
        AggregationOp::Count => "count",
        AggregationOp::Latest => "latest",
        AggregationOp::UniqueCount => "uniqueCount",
        AggregationOp::Percentile { .. } => "percentile",
        AggregationOp::Rate { .. } => "rate",
        AggregationOp::Histogram { .. } => "histogram",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    NotEq,
    In,
    NotIn,
    Like,
}

/// Literal value in a filter condition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    List(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<FilterValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: FilterValue::List(values.into_iter().map(Into::into).collect()),
        }
    }
}

/// Time range a query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TimeWindow {
    /// The last `seconds` seconds, ending now
    Relative { seconds: i64 },
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeWindow {
    pub fn last_seconds(seconds: i64) -> Self {
        TimeWindow::Relative { seconds }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            TimeWindow::Relative { seconds } => *seconds,
            TimeWindow::Absolute { start, end } => (*end - *start).num_seconds(),
        }
    }
}

/// Provider-agnostic description of the data wanted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub provider: Provider,
    pub entity_kind: EntityKind,
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub window: TimeWindow,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub timeseries_secs: Option<u64>,
    /// Inner query whose output rows this descriptor aggregates over
    #[serde(default)]
    pub source: Option<Box<QueryDescriptor>>,
}

impl QueryDescriptor {
    pub fn new(provider: Provider, entity_kind: EntityKind, window: TimeWindow) -> Self {
        Self {
            provider,
            entity_kind,
            aggregations: Vec::new(),
            group_by: Vec::new(),
            window,
            limit: None,
            filters: Vec::new(),
            timeseries_secs: None,
            source: None,
        }
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn timeseries(mut self, bucket_secs: u64) -> Self {
        self.timeseries_secs = Some(bucket_secs);
        self
    }

    pub fn from_subquery(mut self, inner: QueryDescriptor) -> Self {
        self.source = Some(Box::new(inner));
        self
    }

    /// Columns visible to an enclosing query.
    pub fn output_fields(&self) -> Vec<String> {
        self.group_by
            .iter()
            .cloned()
            .chain(self.aggregations.iter().map(Aggregation::output_name))
            .collect()
    }

    /// Copy with filters and aggregations in a canonical order.
    ///
    /// Inclusion lists are sorted and deduplicated; nested sources are
    /// canonicalized recursively. Group-by order is preserved since it
    /// decides facet order in results.
    pub fn canonical(&self) -> QueryDescriptor {
        let mut canonical = self.clone();

        for filter in &mut canonical.filters {
            if let FilterValue::List(values) = &mut filter.value {
                values.sort();
                values.dedup();
            }
        }
        canonical.filters.sort();
        canonical.filters.dedup();
        canonical.aggregations.sort();
        canonical.aggregations.dedup();
        canonical.source = self.source.as_ref().map(|inner| Box::new(inner.canonical()));

        canonical
    }

    /// Number of query levels, counting this one.
    pub fn depth(&self) -> usize {
        1 + self.source.as_ref().map_or(0, |inner| inner.depth())
    }
}

/// One raw observation of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySample {
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

impl EntitySample {
    pub fn new(entity: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            entity: entity.into(),
            timestamp,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Row returned by the time-series query service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    #[serde(default)]
    pub facet_values: Vec<String>,
    #[serde(default)]
    pub metric_values: BTreeMap<String, f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Entity returned by the entity-search service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub guid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySearchResult {
    pub count: usize,
    pub entities: Vec<EntityRef>,
}

/// Unprocessed response from one execution
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Rows(Vec<ResultRow>),
    Entities(EntitySearchResult),
}

/// Aggregation applied locally to samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AggregationKind {
    Sum,
    Average,
    Min,
    Max,
    Count,
    Latest,
    Percentile { p: u8 },
    /// Per-second change between chronologically adjacent samples
    Rate,
    Histogram { buckets: u16 },
    /// Least-squares slope per second
    Trend,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSpec {
    #[serde(flatten)]
    pub kind: AggregationKind,
    pub field: String,
}

impl AggregationSpec {
    pub fn new(kind: AggregationKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
        }
    }
}

/// A named metric a caller wants computed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub name: String,
    #[serde(flatten)]
    pub aggregation: AggregationSpec,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>, kind: AggregationKind, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aggregation: AggregationSpec::new(kind, field),
        }
    }
}

fn default_time_range() -> TimeWindow {
    TimeWindow::last_seconds(300)
}

/// Facade request for a metric view over a set of entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRequest {
    pub entity_kind: EntityKind,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub metrics: Vec<MetricSpec>,
    #[serde(default = "default_time_range")]
    pub time_range: TimeWindow,
    #[serde(default)]
    pub timeseries_secs: Option<u64>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Entity GUIDs the result derives from; used as invalidation tags
    #[serde(default)]
    pub entity_guids: Vec<String>,
    /// Cache keys whose invalidation must also drop this result
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub include_health: bool,
    /// Overrides the volatility-based TTL
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl MetricRequest {
    pub fn new(entity_kind: EntityKind, time_range: TimeWindow) -> Self {
        Self {
            entity_kind,
            filters: Vec::new(),
            group_by: Vec::new(),
            metrics: Vec::new(),
            time_range,
            timeseries_secs: None,
            limit: None,
            entity_guids: Vec::new(),
            depends_on: Vec::new(),
            include_health: false,
            ttl_secs: None,
        }
    }

    pub fn metric(mut self, metric: MetricSpec) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn with_health(mut self) -> Self {
        self.include_health = true;
        self
    }

    pub fn ttl_secs(mut self, ttl: u64) -> Self {
        self.ttl_secs = Some(ttl);
        self
    }
}

/// Facade request for an entity list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    pub entity_kind: EntityKind,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl EntityQuery {
    pub fn new(entity_kind: EntityKind) -> Self {
        Self {
            entity_kind,
            filters: Vec::new(),
            ttl_secs: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}
