//! Folds raw entity samples into aggregated metric values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::health::HealthScore;
use crate::models::{AggregationKind, AggregationSpec, EntitySample, MetricSpec, ResultRow};

/// Relative change across the window below which a trend counts as flat
const STABLE_TREND_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Result of one metric; failures are reported per metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum MetricOutcome {
    Value {
        value: f64,
    },
    Histogram {
        buckets: Vec<HistogramBucket>,
    },
    #[serde(rename_all = "camelCase")]
    Trend {
        slope_per_sec: f64,
        direction: TrendDirection,
    },
    Error {
        message: String,
    },
}

impl MetricOutcome {
    fn value(value: f64) -> Self {
        MetricOutcome::Value { value }
    }

    fn error(message: impl Into<String>) -> Self {
        MetricOutcome::Error {
            message: message.into(),
        }
    }

    /// Scalar view of the outcome, if it has one.
    pub fn as_value(&self) -> Option<f64> {
        match self {
            MetricOutcome::Value { value } => Some(*value),
            MetricOutcome::Trend { slope_per_sec, .. } => Some(*slope_per_sec),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MetricOutcome::Error { .. })
    }
}

/// Aggregates for one facet (usually one entity)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAggregate {
    pub facet: Vec<String>,
    pub sample_count: usize,
    pub metrics: BTreeMap<String, MetricOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub groups: Vec<GroupAggregate>,
    pub sample_count: usize,
    pub computed_at: DateTime<Utc>,
}

impl AggregatedResult {
    pub fn group(&self, facet: &[&str]) -> Option<&GroupAggregate> {
        self.groups
            .iter()
            .find(|g| g.facet.iter().map(String::as_str).eq(facet.iter().copied()))
    }
}

/// Apply one aggregation to `samples`. Never mutates the input.
///
/// `rate` and `count` are 0 when there is too little data; other kinds
/// report an error outcome when no sample carries the field.
pub fn aggregate(samples: &[EntitySample], spec: &AggregationSpec) -> MetricOutcome {
    let mut points: Vec<(DateTime<Utc>, f64)> = samples
        .iter()
        .filter_map(|s| s.metrics.get(&spec.field).map(|v| (s.timestamp, *v)))
        .filter(|(_, v)| v.is_finite())
        .collect();
    points.sort_by_key(|(ts, _)| *ts);

    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();

    match spec.kind {
        AggregationKind::Count => MetricOutcome::value(points.len() as f64),
        AggregationKind::Rate => MetricOutcome::value(rate(&points)),
        AggregationKind::Trend => trend(&points),
        _ if values.is_empty() => {
            MetricOutcome::error(format!("no samples carry '{}'", spec.field))
        }
        AggregationKind::Sum => MetricOutcome::value(values.iter().sum()),
        AggregationKind::Average => {
            MetricOutcome::value(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregationKind::Min => MetricOutcome::value(values.iter().copied().fold(f64::INFINITY, f64::min)),
        AggregationKind::Max => {
            MetricOutcome::value(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        }
        AggregationKind::Latest => MetricOutcome::value(values[values.len() - 1]),
        AggregationKind::Percentile { p } => {
            if p > 100 {
                return MetricOutcome::error(format!("percentile {} out of range", p));
            }
            MetricOutcome::value(percentile(values, p))
        }
        AggregationKind::Histogram { buckets } => {
            if buckets == 0 {
                return MetricOutcome::error("histogram needs at least one bucket");
            }
            MetricOutcome::Histogram {
                buckets: histogram(&values, buckets as usize),
            }
        }
    }
}

/// Mean per-second change across chronologically adjacent samples.
/// Pairs without elapsed time, or where the value drops (counter reset), are skipped.
fn rate(points: &[(DateTime<Utc>, f64)]) -> f64 {
    let rates: Vec<f64> = points
        .windows(2)
        .filter_map(|pair| {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            let elapsed = (t1 - t0).num_milliseconds() as f64 / 1000.0;
            let delta = v1 - v0;
            (elapsed > 0.0 && delta >= 0.0).then(|| delta / elapsed)
        })
        .collect();

    if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    }
}

/// Linear-interpolated percentile over the sorted values.
fn percentile(mut values: Vec<f64>, p: u8) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (p as f64 / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * fraction
}

/// Fixed bucket count over the observed value range.
fn histogram(values: &[f64], buckets: usize) -> Vec<HistogramBucket> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / buckets as f64;

    let mut result: Vec<HistogramBucket> = (0..buckets)
        .map(|i| HistogramBucket {
            lower: min + width * i as f64,
            upper: if i + 1 == buckets { max } else { min + width * (i + 1) as f64 },
            count: 0,
        })
        .collect();

    for value in values {
        let index = if width > 0.0 {
            (((value - min) / width) as usize).min(buckets - 1)
        } else {
            0
        };
        result[index].count += 1;
    }
    result
}

/// Least-squares slope of value over time.
fn trend(points: &[(DateTime<Utc>, f64)]) -> MetricOutcome {
    let flat = MetricOutcome::Trend {
        slope_per_sec: 0.0,
        direction: TrendDirection::Stable,
    };
    if points.len() < 2 {
        return flat;
    }

    let origin = points[0].0;
    let xs: Vec<f64> = points
        .iter()
        .map(|(ts, _)| (*ts - origin).num_milliseconds() as f64 / 1000.0)
        .collect();
    let n = points.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, v)| v).sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (x, (_, y)) in xs.iter().zip(points) {
        covariance += (x - mean_x) * (y - mean_y);
        variance += (x - mean_x).powi(2);
    }
    if variance == 0.0 {
        return flat;
    }

    let slope = covariance / variance;
    let span = xs[xs.len() - 1] - xs[0];
    let change = slope * span;
    let direction = if change.abs() <= STABLE_TREND_RATIO * mean_y.abs() {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Rising
    } else {
        TrendDirection::Falling
    };

    MetricOutcome::Trend {
        slope_per_sec: slope,
        direction,
    }
}

/// Convert service rows into samples keyed by metric name.
///
/// Each metric's value is read from the column named after the metric,
/// falling back to the column named after its field. Rows without a
/// timestamp are stamped with `fallback`.
pub fn samples_from_rows(
    rows: &[ResultRow],
    metrics: &[MetricSpec],
    fallback: DateTime<Utc>,
) -> Vec<EntitySample> {
    rows.iter()
        .map(|row| {
            let entity = if row.facet_values.is_empty() {
                "*".to_string()
            } else {
                row.facet_values.join("/")
            };
            let mut sample = EntitySample::new(entity, row.timestamp.unwrap_or(fallback));
            for metric in metrics {
                let value = row
                    .metric_values
                    .get(&metric.name)
                    .or_else(|| row.metric_values.get(&metric.aggregation.field));
                if let Some(value) = value {
                    sample.metrics.insert(metric.name.clone(), *value);
                }
            }
            sample
        })
        .collect()
}

/// Group rows by facet and aggregate every requested metric per group.
pub fn aggregate_rows(rows: &[ResultRow], metrics: &[MetricSpec], now: DateTime<Utc>) -> AggregatedResult {
    let mut by_facet: BTreeMap<Vec<String>, Vec<ResultRow>> = BTreeMap::new();
    for row in rows {
        by_facet
            .entry(row.facet_values.clone())
            .or_default()
            .push(row.clone());
    }

    let groups = by_facet
        .into_iter()
        .map(|(facet, rows)| {
            let samples = samples_from_rows(&rows, metrics, now);
            let metrics = metrics
                .iter()
                .map(|metric| {
                    let spec = AggregationSpec::new(metric.aggregation.kind, metric.name.clone());
                    (metric.name.clone(), aggregate(&samples, &spec))
                })
                .collect();
            GroupAggregate {
                facet,
                sample_count: samples.len(),
                metrics,
                health: None,
            }
        })
        .collect();

    AggregatedResult {
        groups,
        sample_count: rows.len(),
        computed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn series(field: &str, points: &[(i64, f64)]) -> Vec<EntitySample> {
        points
            .iter()
            .map(|(t, v)| EntitySample::new("broker-1", at(*t)).with_metric(field, *v))
            .collect()
    }

    fn value(outcome: MetricOutcome) -> f64 {
        outcome.as_value().expect("scalar outcome")
    }

    #[test]
    fn test_rate_with_single_sample_is_zero() {
        let samples = series("bytesIn", &[(0, 1000.0)]);
        let outcome = aggregate(&samples, &AggregationSpec::new(AggregationKind::Rate, "bytesIn"));
        assert_eq!(outcome, MetricOutcome::Value { value: 0.0 });

        let outcome = aggregate(&[], &AggregationSpec::new(AggregationKind::Rate, "bytesIn"));
        assert_eq!(outcome, MetricOutcome::Value { value: 0.0 });
    }

    #[test]
    fn test_rate_uses_chronological_order() {
        let samples = series("bytesIn", &[(20, 3000.0), (0, 1000.0), (10, 2000.0)]);
        let rate = value(aggregate(
            &samples,
            &AggregationSpec::new(AggregationKind::Rate, "bytesIn"),
        ));
        assert!((rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_skips_counter_reset() {
        let samples = series("bytesIn", &[(0, 100.0), (10, 200.0), (20, 5.0), (30, 105.0)]);
        let rate = value(aggregate(
            &samples,
            &AggregationSpec::new(AggregationKind::Rate, "bytesIn"),
        ));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_basic_reductions() {
        let samples = series("cpu", &[(0, 10.0), (1, 40.0), (2, 20.0), (3, 30.0)]);
        let run = |kind| value(aggregate(&samples, &AggregationSpec::new(kind, "cpu")));

        assert_eq!(run(AggregationKind::Sum), 100.0);
        assert_eq!(run(AggregationKind::Average), 25.0);
        assert_eq!(run(AggregationKind::Min), 10.0);
        assert_eq!(run(AggregationKind::Max), 40.0);
        assert_eq!(run(AggregationKind::Latest), 30.0);
        assert_eq!(run(AggregationKind::Count), 4.0);
        assert_eq!(run(AggregationKind::Percentile { p: 50 }), 25.0);
        assert_eq!(run(AggregationKind::Percentile { p: 100 }), 40.0);
        assert_eq!(run(AggregationKind::Percentile { p: 0 }), 10.0);
    }

    #[test]
    fn test_input_samples_are_untouched() {
        let samples = series("cpu", &[(5, 1.0), (0, 2.0)]);
        let before = samples.clone();
        let _ = aggregate(&samples, &AggregationSpec::new(AggregationKind::Rate, "cpu"));
        assert_eq!(samples, before);
    }

    #[test]
    fn test_missing_field_is_an_error_outcome() {
        let samples = series("cpu", &[(0, 1.0)]);
        let outcome = aggregate(&samples, &AggregationSpec::new(AggregationKind::Average, "disk"));
        assert!(outcome.is_error());
    }

    #[test]
    fn test_histogram_buckets() {
        let samples = series("lat", &[(0, 0.0), (1, 2.0), (2, 5.0), (3, 9.9), (4, 10.0)]);
        let outcome = aggregate(
            &samples,
            &AggregationSpec::new(AggregationKind::Histogram { buckets: 2 }, "lat"),
        );
        let MetricOutcome::Histogram { buckets } = outcome else {
            panic!("expected histogram");
        };
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].count, 3);
        assert_eq!(buckets[1].upper, 10.0);
    }

    #[test]
    fn test_histogram_single_value() {
        let samples = series("lat", &[(0, 4.0), (1, 4.0)]);
        let outcome = aggregate(
            &samples,
            &AggregationSpec::new(AggregationKind::Histogram { buckets: 3 }, "lat"),
        );
        let MetricOutcome::Histogram { buckets } = outcome else {
            panic!("expected histogram");
        };
        assert_eq!(buckets[0].count, 2);
        assert!(buckets.iter().all(|b| b.lower.is_finite() && b.upper.is_finite()));
    }

    #[test]
    fn test_trend_direction() {
        let rising = series("lag", &[(0, 100.0), (60, 200.0), (120, 300.0)]);
        let outcome = aggregate(&rising, &AggregationSpec::new(AggregationKind::Trend, "lag"));
        assert_eq!(
            outcome,
            MetricOutcome::Trend {
                slope_per_sec: 100.0 / 60.0,
                direction: TrendDirection::Rising
            }
        );

        let flat = series("lag", &[(0, 100.0), (60, 101.0), (120, 100.0)]);
        let outcome = aggregate(&flat, &AggregationSpec::new(AggregationKind::Trend, "lag"));
        assert!(matches!(
            outcome,
            MetricOutcome::Trend { direction: TrendDirection::Stable, .. }
        ));
    }

    #[test]
    fn test_aggregate_rows_groups_by_facet_and_isolates_failures() {
        let now = at(0);
        let row = |facet: &str, secs: i64, cpu: f64| ResultRow {
            facet_values: vec![facet.to_string()],
            metric_values: BTreeMap::from([("cpuPercent".to_string(), cpu)]),
            timestamp: Some(now + Duration::seconds(secs)),
        };
        let rows = vec![row("1", 0, 10.0), row("2", 0, 50.0), row("1", 60, 30.0)];
        let metrics = vec![
            MetricSpec::new("cpu", AggregationKind::Average, "cpuPercent"),
            MetricSpec::new("disk", AggregationKind::Max, "diskUsedPercent"),
        ];

        let result = aggregate_rows(&rows, &metrics, now);

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.sample_count, 3);
        let broker_one = result.group(&["1"]).unwrap();
        assert_eq!(broker_one.sample_count, 2);
        assert_eq!(broker_one.metrics["cpu"], MetricOutcome::Value { value: 20.0 });
        assert!(broker_one.metrics["disk"].is_error());
    }
}
