//! Prompt template rendering.
//!
//! Placeholders use the syntax `{{path}}` where `path` is a dot-separated
//! lookup into the execution context (`stepKey.fieldName`, recursively).
//! Extraction and resolution are separate so the validator can inspect
//! placeholders without a context.
//!
//! A path whose root segment is missing entirely is a validation-time error
//! (see `validate`). A path that resolves partway and then misses a nested
//! field renders as the literal text `undefined` -- preserved historical
//! behavior; a stricter renderer could error here instead.

use serde_json::Value;

/// Literal text substituted for a placeholder that fails to resolve.
pub const UNRESOLVED_TEXT: &str = "undefined";

// ---------------------------------------------------------------------------
// Placeholder extraction
// ---------------------------------------------------------------------------

/// Find every `{{path}}` placeholder in a template, in order of appearance.
///
/// Inner whitespace is tolerated and trimmed: `{{ a.b }}` yields `a.b`.
/// Unterminated `{{` sequences are ignored.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let inner = after[..end].trim();
                if !inner.is_empty() {
                    paths.push(inner.to_string());
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    paths
}

/// The root segment of a dot-separated placeholder path.
pub fn path_root(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Outcome of resolving a placeholder path against a context value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// The full path resolved to a value.
    Found(&'a Value),
    /// Some segment of the path was missing.
    Missing,
}

/// Walk a dot-separated path through nested JSON objects.
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> Resolution<'a> {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Resolution::Missing,
        }
    }
    Resolution::Found(current)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Substitute every placeholder in `template` using `context`.
///
/// Resolved values render canonically: strings verbatim, null/bool/number
/// via their display form, arrays and objects as compact JSON. Missing
/// paths render as `UNRESOLVED_TEXT`.
pub fn render(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let inner = after[..end].trim();
                if inner.is_empty() {
                    // Preserve degenerate "{{}}" literally.
                    out.push_str(&rest[start..start + 2 + end + 2]);
                } else {
                    match resolve_path(context, inner) {
                        Resolution::Found(value) => out.push_str(&value_to_text(value)),
                        Resolution::Missing => out.push_str(UNRESOLVED_TEXT),
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Canonical text form of a resolved value.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Arrays and objects render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
