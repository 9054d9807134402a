//! Weighted multi-factor health scoring
//!
//! A [`HealthPolicy`] lists factors, each with a weight, optional hard-fail
//! conditions and ordered threshold rules per signal. Policies are plain
//! data so deployments can override the defaults from JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::aggregator::MetricOutcome;
use crate::error::{AppError, Result};
use crate::models::{AggregationKind, EntityKind, MetricRequest, MetricSpec, TimeWindow};

/// Measured input to a health factor; names match the entity field catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Signal {
    ActiveControllers,
    OfflinePartitions,
    UnderReplicatedPartitions,
    UnderMinIsrPartitions,
    CpuPercent,
    DiskUsedPercent,
    MemoryPercent,
    RequestHandlerIdlePercent,
    NetworkProcessorIdlePercent,
    ProduceLatencyMs,
    FetchLatencyMs,
    ErrorRatePercent,
    PartitionSkewPercent,
    ActiveMembers,
    MaxLag,
    LagGrowthPerSecond,
    RebalancesPerHour,
}

impl Signal {
    pub const ALL: [Signal; 17] = [
        Signal::ActiveControllers,
        Signal::OfflinePartitions,
        Signal::UnderReplicatedPartitions,
        Signal::UnderMinIsrPartitions,
        Signal::CpuPercent,
        Signal::DiskUsedPercent,
        Signal::MemoryPercent,
        Signal::RequestHandlerIdlePercent,
        Signal::NetworkProcessorIdlePercent,
        Signal::ProduceLatencyMs,
        Signal::FetchLatencyMs,
        Signal::ErrorRatePercent,
        Signal::PartitionSkewPercent,
        Signal::ActiveMembers,
        Signal::MaxLag,
        Signal::LagGrowthPerSecond,
        Signal::RebalancesPerHour,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::ActiveControllers => "activeControllers",
            Signal::OfflinePartitions => "offlinePartitions",
            Signal::UnderReplicatedPartitions => "underReplicatedPartitions",
            Signal::UnderMinIsrPartitions => "underMinIsrPartitions",
            Signal::CpuPercent => "cpuPercent",
            Signal::DiskUsedPercent => "diskUsedPercent",
            Signal::MemoryPercent => "memoryPercent",
            Signal::RequestHandlerIdlePercent => "requestHandlerIdlePercent",
            Signal::NetworkProcessorIdlePercent => "networkProcessorIdlePercent",
            Signal::ProduceLatencyMs => "produceLatencyMs",
            Signal::FetchLatencyMs => "fetchLatencyMs",
            Signal::ErrorRatePercent => "errorRatePercent",
            Signal::PartitionSkewPercent => "partitionSkewPercent",
            Signal::ActiveMembers => "activeMembers",
            Signal::MaxLag => "maxLag",
            Signal::LagGrowthPerSecond => "lagGrowthPerSecond",
            Signal::RebalancesPerHour => "rebalancesPerHour",
        }
    }

    pub fn from_name(name: &str) -> Option<Signal> {
        Signal::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals observed for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthFactors {
    pub kind: EntityKind,
    #[serde(default)]
    pub signals: BTreeMap<Signal, f64>,
}

impl HealthFactors {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            signals: BTreeMap::new(),
        }
    }

    pub fn with(mut self, signal: Signal, value: f64) -> Self {
        self.signals.insert(signal, value);
        self
    }

    pub fn active_controller(self, active: bool) -> Self {
        self.with(Signal::ActiveControllers, if active { 1.0 } else { 0.0 })
    }

    /// Pick up every metric whose name is a known signal and has a scalar value.
    pub fn from_metrics(kind: EntityKind, metrics: &BTreeMap<String, MetricOutcome>) -> Self {
        let signals = metrics
            .iter()
            .filter_map(|(name, outcome)| {
                let signal = Signal::from_name(name)?;
                let value = outcome.as_value()?;
                value.is_finite().then_some((signal, value))
            })
            .collect();
        Self { kind, signals }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    Above,
    AtLeast,
    Below,
    AtMost,
}

impl Comparison {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::AtLeast => value >= threshold,
            Comparison::Below => value < threshold,
            Comparison::AtMost => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRule {
    pub when: Comparison,
    pub threshold: f64,
    pub penalty: u8,
    pub severity: Severity,
    pub issue: String,
}

/// Ordered rules for one signal; the first matching rule applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub signal: Signal,
    pub rules: Vec<ThresholdRule>,
}

/// Condition that zeroes the factor and the overall score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardFail {
    pub signal: Signal,
    pub when: Comparison,
    pub threshold: f64,
    pub issue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorPolicy {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub hard_fails: Vec<HardFail>,
    #[serde(default)]
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub factors: Vec<FactorPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthStatus {
    /// Bands are inclusive on their lower bound.
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => HealthStatus::Excellent,
            80..=89 => HealthStatus::Good,
            70..=79 => HealthStatus::Fair,
            50..=69 => HealthStatus::Poor,
            _ => HealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub factor: String,
    pub signal: Signal,
    pub severity: Severity,
    pub message: String,
}

/// Complete score for one entity; always produced as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    pub overall: u8,
    pub components: BTreeMap<String, u8>,
    pub status: HealthStatus,
    pub issues: Vec<Issue>,
}

fn rule(when: Comparison, threshold: f64, penalty: u8, severity: Severity, issue: &str) -> ThresholdRule {
    ThresholdRule {
        when,
        threshold,
        penalty,
        severity,
        issue: issue.to_string(),
    }
}

fn check(signal: Signal, rules: Vec<ThresholdRule>) -> Check {
    Check { signal, rules }
}

fn factor(name: &str, weight: f64, hard_fails: Vec<HardFail>, checks: Vec<Check>) -> FactorPolicy {
    FactorPolicy {
        name: name.to_string(),
        weight,
        hard_fails,
        checks,
    }
}

fn resource_checks() -> Vec<Check> {
    use Comparison::Above;
    use Severity::{Critical, Warning};
    vec![
        check(
            Signal::CpuPercent,
            vec![
                rule(Above, 90.0, 40, Critical, "CPU saturated"),
                rule(Above, 75.0, 20, Warning, "CPU running hot"),
            ],
        ),
        check(
            Signal::DiskUsedPercent,
            vec![
                rule(Above, 90.0, 50, Critical, "Disk nearly full"),
                rule(Above, 80.0, 25, Warning, "Disk usage high"),
            ],
        ),
        check(
            Signal::MemoryPercent,
            vec![
                rule(Above, 90.0, 30, Critical, "Memory exhausted"),
                rule(Above, 80.0, 15, Warning, "Memory usage high"),
            ],
        ),
    ]
}

fn idle_check(signal: Signal, label: &str) -> Check {
    use Comparison::Below;
    use Severity::{Critical, Warning};
    check(
        signal,
        vec![
            rule(Below, 10.0, 40, Critical, &format!("{} threads saturated", label)),
            rule(Below, 30.0, 20, Warning, &format!("{} threads busy", label)),
        ],
    )
}

impl HealthPolicy {
    /// Built-in policy for an entity kind.
    pub fn default_for(kind: EntityKind) -> Self {
        use Comparison::{Above, Below};
        use Severity::{Critical, Warning};

        let factors = match kind {
            EntityKind::Cluster => vec![
                factor(
                    "availability",
                    0.35,
                    vec![HardFail {
                        signal: Signal::ActiveControllers,
                        when: Below,
                        threshold: 1.0,
                        issue: "No active controller".to_string(),
                    }],
                    vec![check(
                        Signal::OfflinePartitions,
                        vec![
                            rule(Above, 10.0, 60, Critical, "Many partitions offline"),
                            rule(Above, 0.0, 40, Critical, "Partitions offline"),
                        ],
                    )],
                ),
                factor(
                    "reliability",
                    0.25,
                    vec![],
                    vec![
                        check(
                            Signal::UnderReplicatedPartitions,
                            vec![
                                rule(Above, 10.0, 40, Critical, "Widespread under-replication"),
                                rule(Above, 0.0, 20, Warning, "Under-replicated partitions"),
                            ],
                        ),
                        check(
                            Signal::UnderMinIsrPartitions,
                            vec![rule(Above, 0.0, 30, Critical, "Partitions below min ISR")],
                        ),
                    ],
                ),
                factor(
                    "performance",
                    0.20,
                    vec![],
                    vec![
                        check(
                            Signal::ProduceLatencyMs,
                            vec![
                                rule(Above, 1000.0, 40, Critical, "Produce latency severe"),
                                rule(Above, 200.0, 20, Warning, "Produce latency elevated"),
                            ],
                        ),
                        idle_check(Signal::RequestHandlerIdlePercent, "Request handler"),
                    ],
                ),
                factor("capacity", 0.20, vec![], resource_checks()),
            ],
            EntityKind::Broker => vec![
                factor(
                    "availability",
                    0.30,
                    vec![],
                    vec![check(
                        Signal::OfflinePartitions,
                        vec![rule(Above, 0.0, 50, Critical, "Partitions offline")],
                    )],
                ),
                factor(
                    "reliability",
                    0.25,
                    vec![],
                    vec![check(
                        Signal::UnderReplicatedPartitions,
                        vec![
                            rule(Above, 10.0, 40, Critical, "Widespread under-replication"),
                            rule(Above, 0.0, 20, Warning, "Under-replicated partitions"),
                        ],
                    )],
                ),
                factor(
                    "performance",
                    0.25,
                    vec![],
                    vec![
                        idle_check(Signal::RequestHandlerIdlePercent, "Request handler"),
                        idle_check(Signal::NetworkProcessorIdlePercent, "Network processor"),
                        check(
                            Signal::FetchLatencyMs,
                            vec![
                                rule(Above, 1000.0, 30, Critical, "Fetch latency severe"),
                                rule(Above, 500.0, 15, Warning, "Fetch latency elevated"),
                            ],
                        ),
                    ],
                ),
                factor("capacity", 0.20, vec![], resource_checks()),
            ],
            EntityKind::Topic => vec![
                factor(
                    "availability",
                    0.30,
                    vec![],
                    vec![check(
                        Signal::OfflinePartitions,
                        vec![rule(Above, 0.0, 60, Critical, "Partitions offline")],
                    )],
                ),
                factor(
                    "reliability",
                    0.30,
                    vec![],
                    vec![check(
                        Signal::UnderReplicatedPartitions,
                        vec![rule(Above, 0.0, 40, Warning, "Under-replicated partitions")],
                    )],
                ),
                factor(
                    "performance",
                    0.20,
                    vec![],
                    vec![check(
                        Signal::ErrorRatePercent,
                        vec![
                            rule(Above, 5.0, 50, Critical, "Error rate high"),
                            rule(Above, 1.0, 20, Warning, "Errors observed"),
                        ],
                    )],
                ),
                factor(
                    "capacity",
                    0.20,
                    vec![],
                    vec![
                        check(
                            Signal::PartitionSkewPercent,
                            vec![
                                rule(Above, 50.0, 40, Critical, "Partitions heavily skewed"),
                                rule(Above, 20.0, 20, Warning, "Partitions skewed"),
                            ],
                        ),
                        check(
                            Signal::DiskUsedPercent,
                            vec![
                                rule(Above, 90.0, 40, Critical, "Disk nearly full"),
                                rule(Above, 80.0, 20, Warning, "Disk usage high"),
                            ],
                        ),
                    ],
                ),
            ],
            EntityKind::ConsumerGroup => vec![
                factor(
                    "availability",
                    0.30,
                    vec![HardFail {
                        signal: Signal::ActiveMembers,
                        when: Below,
                        threshold: 1.0,
                        issue: "No active consumers".to_string(),
                    }],
                    vec![],
                ),
                factor(
                    "reliability",
                    0.20,
                    vec![],
                    vec![check(
                        Signal::RebalancesPerHour,
                        vec![
                            rule(Above, 10.0, 50, Critical, "Group rebalancing constantly"),
                            rule(Above, 2.0, 20, Warning, "Frequent rebalances"),
                        ],
                    )],
                ),
                factor(
                    "performance",
                    0.30,
                    vec![],
                    vec![check(
                        Signal::MaxLag,
                        vec![
                            rule(Above, 100_000.0, 60, Critical, "Consumer lag severe"),
                            rule(Above, 10_000.0, 30, Warning, "Consumer lag high"),
                            rule(Above, 1_000.0, 10, Severity::Info, "Consumer lag building"),
                        ],
                    )],
                ),
                factor(
                    "capacity",
                    0.20,
                    vec![],
                    vec![check(
                        Signal::LagGrowthPerSecond,
                        vec![
                            rule(Above, 100.0, 50, Critical, "Consumers falling behind fast"),
                            rule(Above, 10.0, 20, Warning, "Consumers falling behind"),
                        ],
                    )],
                ),
            ],
        };

        HealthPolicy { factors }
    }

    /// Reject policies that could not produce a score in 0..=100.
    pub fn validate(&self) -> Result<()> {
        if self.factors.is_empty() {
            return Err(AppError::InvalidRequest(
                "health policy needs at least one factor".into(),
            ));
        }

        let mut names = HashSet::new();
        let mut total = 0.0;
        for factor in &self.factors {
            if !names.insert(factor.name.as_str()) {
                return Err(AppError::InvalidRequest(format!(
                    "duplicate health factor '{}'",
                    factor.name
                )));
            }
            if !factor.weight.is_finite() || factor.weight < 0.0 {
                return Err(AppError::InvalidRequest(format!(
                    "factor '{}' has invalid weight {}",
                    factor.name, factor.weight
                )));
            }
            total += factor.weight;

            let thresholds = factor
                .hard_fails
                .iter()
                .map(|h| h.threshold)
                .chain(factor.checks.iter().flat_map(|c| c.rules.iter().map(|r| r.threshold)));
            for threshold in thresholds {
                if !threshold.is_finite() {
                    return Err(AppError::InvalidRequest(format!(
                        "factor '{}' has a non-finite threshold",
                        factor.name
                    )));
                }
            }
            if let Some(rule) = factor
                .checks
                .iter()
                .flat_map(|c| &c.rules)
                .find(|r| r.penalty > 100)
            {
                return Err(AppError::InvalidRequest(format!(
                    "factor '{}' has penalty {} above 100",
                    factor.name, rule.penalty
                )));
            }
        }

        if (total - 1.0).abs() > 1e-6 {
            return Err(AppError::InvalidRequest(format!(
                "health factor weights sum to {}, expected 1.0",
                total
            )));
        }
        Ok(())
    }
}

/// Scores entities against a policy per entity kind
#[derive(Debug, Clone)]
pub struct HealthCalculator {
    policies: HashMap<EntityKind, HealthPolicy>,
}

impl Default for HealthCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCalculator {
    pub fn new() -> Self {
        let policies = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, HealthPolicy::default_for(kind)))
            .collect();
        Self { policies }
    }

    pub fn with_policy(mut self, kind: EntityKind, policy: HealthPolicy) -> Result<Self> {
        policy.validate()?;
        self.policies.insert(kind, policy);
        Ok(self)
    }

    /// Defaults overridden by a JSON object keyed by entity kind.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: BTreeMap<EntityKind, HealthPolicy> = serde_json::from_str(json)?;
        overrides
            .into_iter()
            .try_fold(Self::new(), |calculator, (kind, policy)| {
                calculator.with_policy(kind, policy)
            })
    }

    pub fn policy(&self, kind: EntityKind) -> HealthPolicy {
        self.policies
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| HealthPolicy::default_for(kind))
    }

    pub fn score(&self, factors: &HealthFactors) -> HealthScore {
        let fallback;
        let policy = match self.policies.get(&factors.kind) {
            Some(policy) => policy,
            None => {
                fallback = HealthPolicy::default_for(factors.kind);
                &fallback
            }
        };

        let mut components = BTreeMap::new();
        let mut issues = Vec::new();
        let mut weighted = 0.0;
        let mut hard_failed = false;

        for factor in &policy.factors {
            let failed = factor.hard_fails.iter().find(|hard| {
                factors
                    .signals
                    .get(&hard.signal)
                    .is_some_and(|value| hard.when.holds(*value, hard.threshold))
            });

            let score = match failed {
                Some(hard) => {
                    hard_failed = true;
                    issues.push(Issue {
                        factor: factor.name.clone(),
                        signal: hard.signal,
                        severity: Severity::Critical,
                        message: hard.issue.clone(),
                    });
                    0
                }
                None => {
                    let mut penalty: u32 = 0;
                    for check in &factor.checks {
                        let Some(value) = factors.signals.get(&check.signal) else {
                            continue;
                        };
                        if let Some(rule) = check
                            .rules
                            .iter()
                            .find(|r| r.when.holds(*value, r.threshold))
                        {
                            penalty += rule.penalty as u32;
                            issues.push(Issue {
                                factor: factor.name.clone(),
                                signal: check.signal,
                                severity: rule.severity,
                                message: format!("{} ({} = {})", rule.issue, check.signal, value),
                            });
                        }
                    }
                    100u32.saturating_sub(penalty) as u8
                }
            };

            weighted += factor.weight * score as f64;
            components.insert(factor.name.clone(), score);
        }

        let overall = if hard_failed {
            0
        } else {
            weighted.round().clamp(0.0, 100.0) as u8
        };

        HealthScore {
            overall,
            components,
            status: HealthStatus::from_score(overall),
            issues,
        }
    }
}

/// Metrics a health view needs for an entity kind, named after their signals.
pub fn health_metrics(kind: EntityKind) -> Vec<MetricSpec> {
    use AggregationKind::{Average, Latest, Max};

    let metrics: &[(Signal, AggregationKind)] = match kind {
        EntityKind::Cluster => &[
            (Signal::ActiveControllers, Latest),
            (Signal::OfflinePartitions, Latest),
            (Signal::UnderReplicatedPartitions, Latest),
            (Signal::UnderMinIsrPartitions, Latest),
            (Signal::ProduceLatencyMs, Average),
            (Signal::RequestHandlerIdlePercent, Average),
            (Signal::CpuPercent, Average),
            (Signal::DiskUsedPercent, Latest),
            (Signal::MemoryPercent, Average),
        ],
        EntityKind::Broker => &[
            (Signal::OfflinePartitions, Latest),
            (Signal::UnderReplicatedPartitions, Latest),
            (Signal::RequestHandlerIdlePercent, Average),
            (Signal::NetworkProcessorIdlePercent, Average),
            (Signal::FetchLatencyMs, Average),
            (Signal::CpuPercent, Average),
            (Signal::DiskUsedPercent, Latest),
            (Signal::MemoryPercent, Average),
        ],
        EntityKind::Topic => &[
            (Signal::OfflinePartitions, Latest),
            (Signal::UnderReplicatedPartitions, Latest),
            (Signal::ErrorRatePercent, Average),
            (Signal::PartitionSkewPercent, Latest),
            (Signal::DiskUsedPercent, Latest),
        ],
        EntityKind::ConsumerGroup => &[
            (Signal::ActiveMembers, Latest),
            (Signal::RebalancesPerHour, Latest),
            (Signal::MaxLag, Max),
            (Signal::LagGrowthPerSecond, Average),
        ],
    };

    metrics
        .iter()
        .map(|(signal, aggregation)| MetricSpec::new(signal.as_str(), *aggregation, signal.as_str()))
        .collect()
}

/// Request for the standard health view of an entity kind.
pub fn health_request(kind: EntityKind, window: TimeWindow) -> MetricRequest {
    health_metrics(kind)
        .into_iter()
        .fold(MetricRequest::new(kind, window), MetricRequest::metric)
        .with_health()
}
