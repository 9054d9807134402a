//! Query building: descriptors to dialect-specific query strings

pub mod builder;
pub mod entity_search;
pub mod nrql;

pub use builder::{build, BuiltQuery, Dialect, MAX_NESTING_DEPTH};

use crate::error::{AppError, Result};
use crate::models::FilterValue;

/// Quote a string literal, escaping backslashes and single quotes.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// Render a filter value as a literal; lists become `(a, b, c)`.
pub fn render_value(value: &FilterValue) -> Result<String> {
    match value {
        FilterValue::Text(text) => Ok(quote_literal(text)),
        FilterValue::Integer(n) => Ok(n.to_string()),
        FilterValue::Bool(b) => Ok(b.to_string()),
        FilterValue::List(values) => {
            if values.is_empty() {
                return Err(AppError::InvalidDescriptor(
                    "inclusion list must not be empty".into(),
                ));
            }
            let items = values
                .iter()
                .map(|v| match v {
                    FilterValue::List(_) => Err(AppError::InvalidDescriptor(
                        "nested lists are not supported in filters".into(),
                    )),
                    scalar => render_value(scalar),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", items.join(", ")))
        }
    }
}

/// Render an attribute name, backtick-quoting anything that is not a plain identifier.
pub fn render_identifier(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain || name == "*" {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}
