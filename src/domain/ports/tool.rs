//! Tool port and argument normalization.
//!
//! Concrete tools (file I/O, bash, grep, LSP) live outside the core.
//! The loop normalizes model-produced arguments before handing them to
//! a tool's schema validator: weaker models emit booleans as strings
//! and string arrays where newline-delimited text is expected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::error::ToolError;
use crate::domain::models::policy::RiskLevel;
use crate::services::cancellation::CancellationToken;

/// Static declaration a tool exposes to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
    pub danger_level: RiskLevel,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, danger_level: RiskLevel) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object"}),
            danger_level,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }
}

/// What a tool execution produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), metadata: HashMap::new(), errors: Vec::new() }
    }

    pub fn failure(output: impl Into<String>, errors: Vec<String>) -> Self {
        Self { success: false, output: output.into(), metadata: HashMap::new(), errors }
    }
}

/// The port every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, args: Value, token: &CancellationToken) -> Result<ToolOutcome, ToolError>;
}

/// Coerce model-produced argument values toward the tool's schema.
///
/// Top-level string values spelling a boolean (`true|false|1|0|yes|no`,
/// case- and whitespace-insensitive) become booleans; top-level arrays
/// whose elements are all strings join into newline-delimited text.
pub fn coerce_arguments(args: &Value) -> Value {
    let Some(map) = args.as_object() else {
        return args.clone();
    };

    let mut out = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        let coerced = match value {
            Value::String(s) => parse_string_bool(s).map_or_else(|| value.clone(), Value::Bool),
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_string) => {
                let joined = items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n");
                Value::String(joined)
            }
            other => other.clone(),
        };
        out.insert(key.clone(), coerced);
    }
    Value::Object(out)
}

fn parse_string_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Bash timeout heuristic: callers habitually pass seconds. Values below
/// 300 are assumed seconds and scaled to milliseconds; values at or
/// above 300 are already milliseconds. Zero and negatives pass through.
pub fn normalize_bash_timeout(value: i64) -> i64 {
    if value > 0 && value < 300 {
        value * 1000
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_string_booleans() {
        let args = json!({"force": "true", "dry_run": " NO ", "count": "5x"});
        let coerced = coerce_arguments(&args);
        assert_eq!(coerced["force"], json!(true));
        assert_eq!(coerced["dry_run"], json!(false));
        // Non-boolean strings are untouched.
        assert_eq!(coerced["count"], json!("5x"));
    }

    #[test]
    fn test_coerce_one_and_zero() {
        let args = json!({"a": "1", "b": "0"});
        let coerced = coerce_arguments(&args);
        assert_eq!(coerced["a"], json!(true));
        assert_eq!(coerced["b"], json!(false));
    }

    #[test]
    fn test_coerce_string_array_joins() {
        let args = json!({"lines": ["first", "second", "third"]});
        let coerced = coerce_arguments(&args);
        assert_eq!(coerced["lines"], json!("first\nsecond\nthird"));
    }

    #[test]
    fn test_coerce_leaves_mixed_arrays() {
        let args = json!({"items": ["a", 1]});
        let coerced = coerce_arguments(&args);
        assert_eq!(coerced["items"], json!(["a", 1]));
    }

    #[test]
    fn test_coerce_non_object_passthrough() {
        assert_eq!(coerce_arguments(&json!("raw")), json!("raw"));
        assert_eq!(coerce_arguments(&json!(null)), json!(null));
    }

    #[test]
    fn test_bash_timeout_heuristic() {
        assert_eq!(normalize_bash_timeout(5), 5000);
        assert_eq!(normalize_bash_timeout(299), 299_000);
        assert_eq!(normalize_bash_timeout(300), 300);
        assert_eq!(normalize_bash_timeout(30_000), 30_000);
        assert_eq!(normalize_bash_timeout(0), 0);
        assert_eq!(normalize_bash_timeout(-5), -5);
    }
}
