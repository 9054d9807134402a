//! Aggregation/time-series dialect renderer

use crate::error::Result;
use crate::models::{Aggregation, AggregationOp, Filter, FilterOp, QueryDescriptor, TimeWindow};
use crate::query::builder::{build, Dialect};
use crate::query::{quote_literal, render_identifier, render_value};

/// Render a canonical descriptor as a time-series query.
pub fn render(descriptor: &QueryDescriptor) -> Result<String> {
    let select = descriptor
        .aggregations
        .iter()
        .map(render_aggregation)
        .collect::<Vec<_>>()
        .join(", ");

    let from = match &descriptor.source {
        Some(inner) => format!("({})", build(inner, Dialect::Nrql)?.text),
        None => descriptor
            .provider
            .event_type(descriptor.entity_kind)
            .to_string(),
    };

    let mut query = format!("SELECT {} FROM {}", select, from);

    if !descriptor.filters.is_empty() {
        let conditions = descriptor
            .filters
            .iter()
            .map(render_filter)
            .collect::<Result<Vec<_>>>()?;
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }

    if !descriptor.group_by.is_empty() {
        let facets = descriptor
            .group_by
            .iter()
            .map(|f| render_identifier(f))
            .collect::<Vec<_>>();
        query.push_str(" FACET ");
        query.push_str(&facets.join(", "));
    }

    if let Some(limit) = descriptor.limit {
        query.push_str(&format!(" LIMIT {}", limit));
    }

    query.push(' ');
    query.push_str(&render_window(&descriptor.window));

    if let Some(bucket) = descriptor.timeseries_secs {
        query.push_str(&format!(" TIMESERIES {} seconds", bucket));
    }

    Ok(query)
}

fn render_aggregation(aggregation: &Aggregation) -> String {
    let field = render_identifier(&aggregation.field);
    let call = match aggregation.op {
        AggregationOp::Sum => format!("sum({})", field),
        AggregationOp::Average => format!("average({})", field),
        AggregationOp::Min => format!("min({})", field),
        AggregationOp::Max => format!("max({})", field),
        AggregationOp::Count => format!("count({})", field),
        AggregationOp::Latest => format!("latest({})", field),
        AggregationOp::UniqueCount => format!("uniqueCount({})", field),
        AggregationOp::Percentile { p } => format!("percentile({}, {})", field, p),
        AggregationOp::Rate { per_secs } => {
            format!("rate(sum({}), {} seconds)", field, per_secs)
        }
        AggregationOp::Histogram { buckets } => format!("histogram({}, {})", field, buckets),
    };
    match &aggregation.alias {
        Some(alias) => format!("{} AS {}", call, quote_literal(alias)),
        None => call,
    }
}

fn render_filter(filter: &Filter) -> Result<String> {
    let op = match filter.op {
        FilterOp::Eq => "=",
        FilterOp::NotEq => "!=",
        FilterOp::In => "IN",
        FilterOp::NotIn => "NOT IN",
        FilterOp::Like => "LIKE",
    };
    Ok(format!(
        "{} {} {}",
        render_identifier(&filter.field),
        op,
        render_value(&filter.value)?
    ))
}

fn render_window(window: &TimeWindow) -> String {
    match window {
        TimeWindow::Relative { seconds } => format!("SINCE {} seconds ago", seconds),
        TimeWindow::Absolute { start, end } => format!(
            "SINCE {} UNTIL {}",
            start.timestamp_millis(),
            end.timestamp_millis()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Provider};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_render_full_query() {
        let descriptor = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Topic,
            TimeWindow::last_seconds(3600),
        )
        .aggregate(Aggregation::new(AggregationOp::Sum, "bytesInPerSecond").with_alias("bytesIn"))
        .aggregate(Aggregation::new(AggregationOp::Percentile { p: 95 }, "errorRatePercent"))
        .filter(Filter::eq("clusterName", "prod-kafka"))
        .filter(Filter::is_in("topic", ["orders", "payments"]))
        .group_by("topic")
        .limit(25)
        .timeseries(60);

        let built = build(&descriptor, Dialect::Nrql).unwrap();
        assert_eq!(
            built.text,
            "SELECT sum(bytesInPerSecond) AS 'bytesIn', percentile(errorRatePercent, 95) \
             FROM AwsMskTopicSample \
             WHERE clusterName = 'prod-kafka' AND topic IN ('orders', 'payments') \
             FACET topic LIMIT 25 SINCE 3600 seconds ago TIMESERIES 60 seconds"
        );
    }

    #[test]
    fn test_render_escapes_injected_quotes() {
        let descriptor = QueryDescriptor::new(
            Provider::ConfluentCloud,
            EntityKind::Cluster,
            TimeWindow::last_seconds(60),
        )
        .aggregate(Aggregation::new(AggregationOp::Count, "*"))
        .filter(Filter::eq("clusterName", "x' OR clusterName LIKE '%"));

        let built = build(&descriptor, Dialect::Nrql).unwrap();
        assert_eq!(
            built.text,
            "SELECT count(*) FROM ConfluentCloudClusterSample \
             WHERE clusterName = 'x\\' OR clusterName LIKE \\'%' SINCE 60 seconds ago"
        );
    }

    #[test]
    fn test_render_nested_source() {
        let inner = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Broker,
            TimeWindow::last_seconds(600),
        )
        .aggregate(Aggregation::new(AggregationOp::Sum, "bytesInPerSecond").with_alias("total"))
        .group_by("brokerId");
        let outer = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Broker,
            TimeWindow::last_seconds(600),
        )
        .aggregate(Aggregation::new(AggregationOp::Max, "total"))
        .from_subquery(inner);

        let built = build(&outer, Dialect::Nrql).unwrap();
        assert_eq!(
            built.text,
            "SELECT max(total) FROM (SELECT sum(bytesInPerSecond) AS 'total' \
             FROM AwsMskBrokerSample FACET brokerId SINCE 600 seconds ago) \
             SINCE 600 seconds ago"
        );
    }

    #[test]
    fn test_render_absolute_window_and_rate() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let descriptor = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Broker,
            TimeWindow::Absolute { start, end },
        )
        .aggregate(Aggregation::new(AggregationOp::Rate { per_secs: 1 }, "messagesInPerSecond"));

        let built = build(&descriptor, Dialect::Nrql).unwrap();
        assert_eq!(
            built.text,
            "SELECT rate(sum(messagesInPerSecond), 1 seconds) FROM AwsMskBrokerSample \
             SINCE 1704067200000 UNTIL 1704070800000"
        );
    }
}
