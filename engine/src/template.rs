//! `{{var}}` template rendering
//!
//! The same placeholder syntax appears in two places: endpoint URIs (expanded
//! against the environment snapshot at engine start) and transform templates
//! (rendered against each message). Both go through [`render`]; the caller
//! picks what happens when a variable has no value and no filter.
//!
//! Supported placeholder forms:
//!
//! ```text
//! {{NAME}}                   value of NAME
//! {{NAME|default('x')}}      value of NAME, or "x" when absent
//! {{NAME|required}}          value of NAME, error when absent
//! ```
//!
//! Rendering is idempotent over strings without placeholders: input with no
//! `{{` comes back unchanged.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use virta_core::Message;

/// Error raised while rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TemplateError(pub String);

/// What to do when a placeholder has no value and no `default`/`required`
/// filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissing {
    /// Fail the render (URI expansion: missing env var is a config error)
    Error,
    /// Render the placeholder as an empty string (transform templates)
    Empty,
}

/// A scope that placeholder names resolve against
pub trait Lookup {
    /// Look up a variable by name
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Lookup for Message {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Lookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).map(|v| Value::String(v.clone()))
    }
}

/// Render `input`, substituting every `{{…}}` placeholder from `scope`
pub fn render(
    input: &str,
    scope: &dyn Lookup,
    on_missing: OnMissing,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            TemplateError(format!("unterminated placeholder in '{input}'"))
        })?;
        let inner = &after[..end];
        out.push_str(&expand(inner, scope, on_missing)?);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Whether `input` contains any placeholder syntax
pub fn has_placeholders(input: &str) -> bool {
    input.contains("{{")
}

/// Check placeholder syntax without resolving anything
///
/// Lets route construction reject malformed templates up front, before any
/// message arrives.
pub fn validate(input: &str) -> Result<(), TemplateError> {
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            TemplateError(format!("unterminated placeholder in '{input}'"))
        })?;
        parse_placeholder(&after[..end])?;
        rest = &after[end + 2..];
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Filter {
    None,
    Default(String),
    Required,
}

fn expand(
    inner: &str,
    scope: &dyn Lookup,
    on_missing: OnMissing,
) -> Result<String, TemplateError> {
    let (name, filter) = parse_placeholder(inner)?;

    match scope.lookup(name) {
        Some(value) => Ok(value_to_string(&value)),
        None => match filter {
            Filter::Default(fallback) => Ok(fallback),
            Filter::Required => Err(TemplateError(format!(
                "missing required variable '{name}'"
            ))),
            Filter::None => match on_missing {
                OnMissing::Empty => Ok(String::new()),
                OnMissing::Error => Err(TemplateError(format!(
                    "no value for variable '{name}' and no default"
                ))),
            },
        },
    }
}

fn parse_placeholder(inner: &str) -> Result<(&str, Filter), TemplateError> {
    let (name, filter) = match inner.split_once('|') {
        Some((name, filter)) => (name.trim(), parse_filter(filter.trim())?),
        None => (inner.trim(), Filter::None),
    };

    if name.is_empty() {
        return Err(TemplateError("empty placeholder name".to_string()));
    }
    Ok((name, filter))
}

fn parse_filter(filter: &str) -> Result<Filter, TemplateError> {
    if filter == "required" {
        return Ok(Filter::Required);
    }
    if let Some(arg) = filter
        .strip_prefix("default(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let arg = arg.trim();
        let unquoted = arg
            .strip_prefix('\'')
            .and_then(|a| a.strip_suffix('\''))
            .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
            .ok_or_else(|| {
                TemplateError(format!("default() argument must be quoted: '{arg}'"))
            })?;
        return Ok(Filter::Default(unquoted.to_string()));
    }
    Err(TemplateError(format!("unknown template filter '{filter}'")))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
