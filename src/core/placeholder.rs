//! Placeholder scanning and rendering.
//!
//! The grammar is deliberately small:
//!
//! - `${a.b.c}` - a dotted path resolved through a [`Lookup`]
//! - `$$` - a literal `$` (so `$${x}` renders as the text `${x}`)
//! - a lone `$` not followed by `{` or `$` passes through unchanged
//!
//! Path segments are non-empty; numeric segments index into sequences.
//!
//! ```
//! use score_ecs::core::placeholder::{parse, Segment};
//!
//! let segments = parse("postgres://${resources.db.host}:5432").unwrap();
//! assert_eq!(segments.len(), 3);
//! assert_eq!(segments[0], Segment::Literal("postgres://".to_string()));
//! ```

use crate::core::types::{scalar_text, OutputValue};
use thiserror::Error;

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Original text including `${` and `}`
    pub expression: String,
    /// Dotted path segments
    pub path: Vec<String>,
}

impl Placeholder {
    /// First path segment: `resources`, `metadata`, ...
    pub fn namespace(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// Why a placeholder could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("unclosed placeholder at position {0}")]
    Unclosed(usize),

    #[error("malformed placeholder path")]
    Malformed,

    #[error("unknown placeholder namespace '{0}'")]
    UnknownNamespace(String),

    #[error("workload has no resource named '{0}'")]
    UnknownResource(String),

    #[error("resource '{0}' has not been resolved")]
    Unresolved(String),

    #[error("resource '{resource}' has no output '{path}'")]
    MissingOutput { resource: String, path: String },

    #[error("no value at '{0}'")]
    MissingValue(String),

    #[error("value is not a scalar")]
    NonScalar,

    #[error("secret references cannot be embedded in a larger string")]
    SecretInterpolation,
}

/// A failed placeholder along with the expression that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub expression: String,
    pub error: PlaceholderError,
}

/// Resolves placeholder paths to values.
pub trait Lookup {
    fn lookup(&self, path: &[String]) -> Result<OutputValue, PlaceholderError>;
}

/// Parse a string into literal and placeholder segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, Unresolved> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        if ch != '$' {
            literal.push(ch);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                literal.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(Unresolved {
                        expression: input[pos..].to_string(),
                        error: PlaceholderError::Unclosed(pos),
                    });
                }
                let expression = format!("${{{}}}", body);
                let path = parse_path(&body).ok_or_else(|| Unresolved {
                    expression: expression.clone(),
                    error: PlaceholderError::Malformed,
                })?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(Placeholder { expression, path }));
            }
            _ => literal.push('$'),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_path(body: &str) -> Option<Vec<String>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path: Vec<String> = trimmed.split('.').map(|s| s.trim().to_string()).collect();
    if path.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(path)
}

/// All placeholders referenced by a string.
pub fn placeholders(input: &str) -> Result<Vec<Placeholder>, Unresolved> {
    Ok(parse(input)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Render a string.
///
/// A string that is exactly one placeholder yields the looked-up value as-is,
/// preserving its type. Otherwise every placeholder must resolve to a scalar
/// and is interpolated as text. Nothing is returned unless every placeholder
/// resolves.
pub fn render(input: &str, lookup: &dyn Lookup) -> Result<OutputValue, Unresolved> {
    let segments = parse(input)?;

    if let [Segment::Placeholder(p)] = segments.as_slice() {
        return lookup.lookup(&p.path).map_err(|error| Unresolved {
            expression: p.expression.clone(),
            error,
        });
    }

    let mut out = String::with_capacity(input.len());
    for segment in &segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Placeholder(p) => {
                let fail = |error| Unresolved {
                    expression: p.expression.clone(),
                    error,
                };
                let value = lookup.lookup(&p.path).map_err(fail)?;
                let text = match value {
                    OutputValue::Secret(_) => return Err(fail(PlaceholderError::SecretInterpolation)),
                    OutputValue::Value(v) => scalar_text(&v).ok_or_else(|| fail(PlaceholderError::NonScalar))?,
                };
                out.push_str(&text);
            }
        }
    }
    Ok(OutputValue::string(out))
}

/// Render a string into text. Whole-field placeholders must resolve to a scalar.
pub fn render_text(input: &str, lookup: &dyn Lookup) -> Result<String, Unresolved> {
    match render(input, lookup)? {
        OutputValue::Value(v) => scalar_text(&v).ok_or_else(|| Unresolved {
            expression: input.to_string(),
            error: PlaceholderError::NonScalar,
        }),
        OutputValue::Secret(_) => Err(Unresolved {
            expression: input.to_string(),
            error: PlaceholderError::SecretInterpolation,
        }),
    }
}

/// Render every string (including mapping keys) in a YAML tree.
pub fn render_value(
    value: &serde_yaml_ng::Value,
    lookup: &dyn Lookup,
) -> Result<serde_yaml_ng::Value, Unresolved> {
    use serde_yaml_ng::Value;
    match value {
        Value::String(s) => Ok(render(s, lookup)?.into_value()),
        Value::Sequence(items) => items
            .iter()
            .map(|v| render_value(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = serde_yaml_ng::Mapping::new();
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => Value::String(render_text(s, lookup)?),
                    other => other.clone(),
                };
                out.insert(key, render_value(v, lookup)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Tagged(tagged) => Ok(Value::Tagged(Box::new(serde_yaml_ng::value::TaggedValue {
            tag: tagged.tag.clone(),
            value: render_value(&tagged.value, lookup)?,
        }))),
        other => Ok(other.clone()),
    }
}

/// Walk a YAML value by path segments. Numeric segments index sequences.
pub fn traverse<'a>(
    value: &'a serde_yaml_ng::Value,
    path: &[String],
) -> Option<&'a serde_yaml_ng::Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            serde_yaml_ng::Value::Mapping(m) => m.get(segment.as_str())?,
            serde_yaml_ng::Value::Sequence(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
