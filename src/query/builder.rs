//! Descriptor validation, canonicalization and cache-key derivation

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{AppError, Result};
use crate::models::{AggregationOp, FilterOp, FilterValue, QueryDescriptor};
use crate::query::{entity_search, nrql};

/// Deepest allowed chain of nested sources, counting the outer query.
pub const MAX_NESTING_DEPTH: usize = 3;

type Renderer = fn(&QueryDescriptor) -> Result<String>;

/// Query string syntax of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Aggregation/time-series dialect
    Nrql,
    /// Tag/attribute-filtered entity search
    EntitySearch,
}

impl Dialect {
    fn renderer(self) -> Renderer {
        match self {
            Dialect::Nrql => nrql::render,
            Dialect::EntitySearch => entity_search::render,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Nrql => "nrql",
            Dialect::EntitySearch => "entity_search",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nrql" => Ok(Dialect::Nrql),
            "entity_search" => Ok(Dialect::EntitySearch),
            other => Err(AppError::InvalidRequest(format!("Unknown dialect '{}'", other))),
        }
    }
}

/// A query ready for execution. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub dialect: Dialect,
    pub text: String,
    /// Canonicalized form of the originating descriptor
    pub descriptor: QueryDescriptor,
    pub cache_key: String,
}

impl BuiltQuery {
    /// Key under which compatible queries may share one round trip.
    pub fn batch_group(&self) -> String {
        format!(
            "{}:{}:{}",
            self.dialect,
            self.descriptor.provider,
            self.descriptor.entity_kind
        )
    }
}

/// Build an executable query for `dialect`.
///
/// Pure: validates, canonicalizes, renders, and hashes. Nested sources are
/// built recursively and spliced into the outer query by the renderer.
pub fn build(descriptor: &QueryDescriptor, dialect: Dialect) -> Result<BuiltQuery> {
    let depth = descriptor.depth();
    if depth > MAX_NESTING_DEPTH {
        return Err(AppError::QueryTooComplex {
            depth,
            max: MAX_NESTING_DEPTH,
        });
    }

    validate(descriptor)?;

    let canonical = descriptor.canonical();
    let text = (dialect.renderer())(&canonical)?;
    let cache_key = cache_key(&canonical, dialect);

    Ok(BuiltQuery {
        dialect,
        text,
        descriptor: canonical,
        cache_key,
    })
}

/// Stable key for a canonical descriptor plus dialect.
fn cache_key(canonical: &QueryDescriptor, dialect: Dialect) -> String {
    let mut hasher = DefaultHasher::new();
    dialect.hash(&mut hasher);
    canonical.hash(&mut hasher);
    format!("{}:{:016x}", dialect, hasher.finish())
}

fn validate(descriptor: &QueryDescriptor) -> Result<()> {
    if descriptor.aggregations.is_empty() {
        return Err(AppError::InvalidDescriptor(
            "aggregation list must not be empty".into(),
        ));
    }
    if descriptor.window.duration_secs() <= 0 {
        return Err(AppError::InvalidDescriptor(
            "time window must be positive".into(),
        ));
    }
    if descriptor.timeseries_secs == Some(0) {
        return Err(AppError::InvalidDescriptor(
            "timeseries bucket must be positive".into(),
        ));
    }
    if descriptor.limit == Some(0) {
        return Err(AppError::InvalidDescriptor("limit must be positive".into()));
    }

    let known: Vec<String> = match &descriptor.source {
        Some(inner) => inner.output_fields(),
        None => descriptor
            .entity_kind
            .fields()
            .iter()
            .map(|f| f.to_string())
            .collect(),
    };
    let check_field = |field: &str, usage: &str| -> Result<()> {
        if known.iter().any(|k| k == field) {
            Ok(())
        } else {
            Err(AppError::InvalidDescriptor(format!(
                "unknown {} field '{}' for {}",
                usage, field, descriptor.entity_kind
            )))
        }
    };

    for aggregation in &descriptor.aggregations {
        let wildcard = aggregation.field == "*";
        if !(wildcard && aggregation.op == AggregationOp::Count) {
            check_field(&aggregation.field, "aggregation")?;
        }
        match aggregation.op {
            AggregationOp::Percentile { p } if p > 100 => {
                return Err(AppError::InvalidDescriptor(format!(
                    "percentile {} out of range",
                    p
                )))
            }
            AggregationOp::Histogram { buckets: 0 } => {
                return Err(AppError::InvalidDescriptor(
                    "histogram needs at least one bucket".into(),
                ))
            }
            AggregationOp::Rate { per_secs: 0 } => {
                return Err(AppError::InvalidDescriptor(
                    "rate period must be positive".into(),
                ))
            }
            _ => {}
        }
        if aggregation.alias.as_deref() == Some("") {
            return Err(AppError::InvalidDescriptor("alias must not be empty".into()));
        }
    }

    for field in &descriptor.group_by {
        check_field(field, "group-by")?;
    }

    for filter in &descriptor.filters {
        check_field(&filter.field, "filter")?;
        let shape_ok = match (filter.op, &filter.value) {
            (FilterOp::In | FilterOp::NotIn, FilterValue::List(values)) => !values.is_empty(),
            (FilterOp::In | FilterOp::NotIn, _) => false,
            (FilterOp::Like, FilterValue::Text(_)) => true,
            (FilterOp::Like, _) => false,
            (FilterOp::Eq | FilterOp::NotEq, FilterValue::List(_)) => false,
            (FilterOp::Eq | FilterOp::NotEq, _) => true,
        };
        if !shape_ok {
            return Err(AppError::InvalidDescriptor(format!(
                "operator {:?} cannot take value {:?} on '{}'",
                filter.op, filter.value, filter.field
            )));
        }
    }

    if let Some(inner) = &descriptor.source {
        validate(inner)?;
    }

    Ok(())
}
