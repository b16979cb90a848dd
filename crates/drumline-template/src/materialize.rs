use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use drumline_core::trace::QueryTrace;

use crate::error::{Result, TemplateError};

/// One declared template parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default = "bool_true")]
    pub required: bool,
    /// Substituted when the caller binds no value.
    #[serde(default)]
    pub default: Option<Value>,
}

fn bool_true() -> bool {
    true
}

/// Merge bound values with declared defaults.
///
/// Returns `MissingParameter` for any required parameter that has neither a
/// bound value nor a default. Bound values the template never declared pass
/// through untouched — the substitution pass ignores them.
pub fn resolve_params(
    specs: &[ParameterSpec],
    bound: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut resolved = bound.clone();
    for spec in specs {
        if resolved.contains_key(&spec.name) {
            continue;
        }
        match &spec.default {
            Some(default) => {
                resolved.insert(spec.name.clone(), default.clone());
            }
            None if spec.required => {
                return Err(TemplateError::MissingParameter {
                    name: spec.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(resolved)
}

/// Substitutes `{{name}}` placeholders with escaped SQL literals.
pub struct Materializer {
    large_list_threshold: usize,
    max_query_length: usize,
}

impl Materializer {
    pub fn new(large_list_threshold: usize, max_query_length: usize) -> Self {
        Self {
            large_list_threshold,
            max_query_length,
        }
    }

    /// Replace every placeholder in `template` with a literal rendered from
    /// `params`, then enforce the backend length cap on the result.
    ///
    /// Each substitution emits a parameter trace record (summary only, never
    /// the raw value).
    pub fn materialize(
        &self,
        template: &str,
        params: &Map<String, Value>,
        trace: &QueryTrace,
    ) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| TemplateError::Syntax {
                detail: "unclosed placeholder".to_string(),
            })?;
            let name = after[..end].trim();
            if !is_identifier(name) {
                return Err(TemplateError::Syntax {
                    detail: format!("invalid placeholder name: {name:?}"),
                });
            }

            let value = params
                .get(name)
                .ok_or_else(|| TemplateError::MissingParameter {
                    name: name.to_string(),
                })?;

            let rendered = match value {
                Value::Array(items) => {
                    let large = items.len() > self.large_list_threshold;
                    trace.param(name, value, large);
                    self.render_list(name, items)?
                }
                scalar => {
                    trace.param(name, value, false);
                    render_scalar(name, scalar)?
                }
            };
            out.push_str(&rendered);
            rest = &after[end + 2..];
        }
        out.push_str(rest);

        if out.len() > self.max_query_length {
            return Err(TemplateError::LengthExceeded {
                len: out.len(),
                max: self.max_query_length,
            });
        }
        Ok(out)
    }

    /// Render a list parameter. Small lists become an inline parenthesized
    /// literal list usable after `IN`; lists past the threshold switch to a
    /// `VALUES` row constructor to stay within backend query-length limits.
    fn render_list(&self, name: &str, items: &[Value]) -> Result<String> {
        if items.is_empty() {
            // `IN ()` is invalid SQL; `(NULL)` matches nothing.
            return Ok("(NULL)".to_string());
        }
        let literals = items
            .iter()
            .map(|item| render_scalar(name, item))
            .collect::<Result<Vec<_>>>()?;

        if items.len() > self.large_list_threshold {
            let rows = literals
                .iter()
                .map(|lit| format!("({lit})"))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!("(VALUES {rows})"))
        } else {
            Ok(format!("({})", literals.join(", ")))
        }
    }
}

/// Render a scalar JSON value as a SQL literal. Strings are single-quoted
/// with embedded quotes doubled; nested lists/objects are rejected.
fn render_scalar(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(quote(s)),
        Value::Array(_) => Err(TemplateError::UnsupportedValue {
            name: name.to_string(),
            kind: "nested list",
        }),
        Value::Object(_) => Err(TemplateError::UnsupportedValue {
            name: name.to_string(),
            kind: "object",
        }),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
