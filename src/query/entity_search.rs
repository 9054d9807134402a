//! Entity-search dialect renderer
//!
//! Produces filter expressions of the form
//! `domain IN ('INFRA') AND type = '...' [AND tags.x = '...']*`.

use crate::error::{AppError, Result};
use crate::models::{AggregationOp, Filter, FilterOp, QueryDescriptor};
use crate::query::{quote_literal, render_value};

const DOMAIN: &str = "INFRA";

/// Render a canonical descriptor as an entity-search expression.
pub fn render(descriptor: &QueryDescriptor) -> Result<String> {
    if descriptor.source.is_some() {
        return Err(AppError::InvalidDescriptor(
            "entity search does not support subqueries".into(),
        ));
    }
    if descriptor
        .aggregations
        .iter()
        .any(|a| a.op != AggregationOp::Count)
    {
        return Err(AppError::InvalidDescriptor(
            "entity search only supports count aggregations".into(),
        ));
    }
    if !descriptor.group_by.is_empty() || descriptor.timeseries_secs.is_some() {
        return Err(AppError::InvalidDescriptor(
            "entity search cannot facet or bucket results".into(),
        ));
    }

    let mut clauses = vec![
        format!("domain IN ({})", quote_literal(DOMAIN)),
        format!(
            "type = {}",
            quote_literal(descriptor.provider.entity_type(descriptor.entity_kind))
        ),
    ];
    for filter in &descriptor.filters {
        clauses.push(render_filter(filter)?);
    }

    Ok(clauses.join(" AND "))
}

fn render_filter(filter: &Filter) -> Result<String> {
    let attribute = match filter.field.as_str() {
        "entityGuid" => "id".to_string(),
        field => format!("tags.{}", field),
    };
    let op = match filter.op {
        FilterOp::Eq => "=",
        FilterOp::NotEq => "!=",
        FilterOp::In => "IN",
        FilterOp::NotIn => "NOT IN",
        FilterOp::Like => "LIKE",
    };
    Ok(format!("{} {} {}", attribute, op, render_value(&filter.value)?))
}

#[cfg(test)]
mod tests {
    use crate::error::AppError;
    use crate::models::{
        Aggregation, AggregationOp, EntityKind, Filter, Provider, QueryDescriptor, TimeWindow,
    };
    use crate::query::{build, Dialect};

    fn search(kind: EntityKind) -> QueryDescriptor {
        QueryDescriptor::new(Provider::AwsMsk, kind, TimeWindow::last_seconds(3600))
            .aggregate(Aggregation::new(AggregationOp::Count, "*"))
    }

    #[test]
    fn test_render_entity_search() {
        let descriptor = search(EntityKind::Topic)
            .filter(Filter::eq("clusterName", "prod-kafka"))
            .filter(Filter::is_in("topic", ["b", "a"]));

        let built = build(&descriptor, Dialect::EntitySearch).unwrap();
        assert_eq!(
            built.text,
            "domain IN ('INFRA') AND type = 'AWSMSKTOPIC' \
             AND tags.clusterName = 'prod-kafka' AND tags.topic IN ('a', 'b')"
        );
    }

    #[test]
    fn test_entity_guid_maps_to_id() {
        let descriptor = search(EntityKind::Cluster).filter(Filter::eq("entityGuid", "MXxJTkZSQXww"));
        let built = build(&descriptor, Dialect::EntitySearch).unwrap();
        assert!(built.text.ends_with("AND id = 'MXxJTkZSQXww'"));
    }

    #[test]
    fn test_rejects_value_aggregations() {
        let descriptor = search(EntityKind::Broker)
            .aggregate(Aggregation::new(AggregationOp::Average, "cpuPercent"));
        assert!(matches!(
            build(&descriptor, Dialect::EntitySearch),
            Err(AppError::InvalidDescriptor(_))
        ));
    }
}
