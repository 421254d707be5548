//! Shared fakes for integration tests: an in-memory filesystem with
//! tools over it, and stack-building helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use overlord::domain::error::ToolError;
use overlord::domain::models::policy::RiskLevel;
use overlord::domain::ports::tool::{Tool, ToolOutcome, ToolSpec};
use overlord::services::audit_log::{AuditLog, AuditLogConfig};
use overlord::services::cancellation::CancellationToken;
use overlord::services::event_bus::{EventBus, EventBusConfig};
use overlord::services::intent_classifier::IntentClassifier;
use overlord::services::policy_engine::{PolicyEngine, PolicyEngineConfig};

/// In-memory filesystem shared by the fake tools.
#[derive(Default)]
pub struct FakeFs {
    files: Mutex<HashMap<String, String>>,
    pub writes: Mutex<Vec<(String, String)>>,
    pub deletes: Mutex<Vec<String>>,
}

impl FakeFs {
    pub fn with_files(entries: &[(&str, &str)]) -> Arc<Self> {
        let fs = Self::default();
        if let Ok(mut files) = fs.files.lock() {
            for (path, content) in entries {
                files.insert((*path).to_string(), (*content).to_string());
            }
        }
        Arc::new(fs)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().map(|f| f.contains_key(path)).unwrap_or(false)
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.files.lock().ok().and_then(|f| f.get(path).cloned())
    }
}

fn path_arg(args: &Value) -> Result<String, ToolError> {
    args.get("path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: "fs".to_string(),
            reason: "missing 'path'".to_string(),
        })
}

pub struct ReadFileTool(pub Arc<FakeFs>);

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("read_file", "Read a file's contents", RiskLevel::Low)
            .with_parameters(json!({"type": "object", "properties": {"path": {"type": "string"}}}))
    }

    async fn execute(&self, args: Value, _token: &CancellationToken) -> Result<ToolOutcome, ToolError> {
        let path = path_arg(&args)?;
        match self.0.read(&path) {
            Some(content) => Ok(ToolOutcome::ok(content)),
            None => Ok(ToolOutcome::failure(
                format!("no such file: {path}"),
                vec!["file not found".to_string()],
            )),
        }
    }
}

pub struct ListFilesTool(pub Arc<FakeFs>);

#[async_trait]
impl Tool for ListFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("list_files", "List files in the workspace", RiskLevel::Low)
    }

    async fn execute(&self, _args: Value, _token: &CancellationToken) -> Result<ToolOutcome, ToolError> {
        let mut names: Vec<String> =
            self.0.files.lock().map(|f| f.keys().cloned().collect()).unwrap_or_default();
        names.sort();
        Ok(ToolOutcome::ok(names.join("\n")))
    }
}

pub struct WriteFileTool(pub Arc<FakeFs>);

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("write_file", "Write content to a file", RiskLevel::Medium)
    }

    async fn execute(&self, args: Value, _token: &CancellationToken) -> Result<ToolOutcome, ToolError> {
        let path = path_arg(&args)?;
        let content = args.get("content").and_then(Value::as_str).unwrap_or("").to_string();
        if let Ok(mut files) = self.0.files.lock() {
            files.insert(path.clone(), content.clone());
        }
        if let Ok(mut writes) = self.0.writes.lock() {
            writes.push((path.clone(), content));
        }
        Ok(ToolOutcome::ok(format!("wrote {path}")))
    }
}

pub struct DeleteFileTool(pub Arc<FakeFs>);

#[async_trait]
impl Tool for DeleteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("delete_file", "Delete a file", RiskLevel::High)
    }

    async fn execute(&self, args: Value, _token: &CancellationToken) -> Result<ToolOutcome, ToolError> {
        let path = path_arg(&args)?;
        if let Ok(mut files) = self.0.files.lock() {
            files.remove(&path);
        }
        if let Ok(mut deletes) = self.0.deletes.lock() {
            deletes.push(path.clone());
        }
        Ok(ToolOutcome::ok(format!("deleted {path}")))
    }
}

/// A tool that takes a long time; used for cancellation tests.
pub struct SlowTool(pub Duration);

#[async_trait]
impl Tool for SlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("slow_tool", "Takes a while", RiskLevel::Low)
    }

    async fn execute(&self, _args: Value, _token: &CancellationToken) -> Result<ToolOutcome, ToolError> {
        tokio::time::sleep(self.0).await;
        Ok(ToolOutcome::ok("finally"))
    }
}

/// A policy engine over the default rule set, sharing one event bus.
pub fn make_policy(event_bus: &Arc<EventBus>, intent_aware: bool) -> Arc<PolicyEngine> {
    Arc::new(PolicyEngine::with_default_rules(
        PolicyEngineConfig { intent_aware, ..Default::default() },
        IntentClassifier::default(),
        Arc::new(AuditLog::new(AuditLogConfig::default())),
        Arc::clone(event_bus),
    ))
}

pub fn make_bus() -> Arc<EventBus> {
    Arc::new(EventBus::new(EventBusConfig::default()))
}
