//! Policy evaluation throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

use overlord::domain::models::message::{Message, ToolCall};
use overlord::domain::models::policy::EvaluationContext;
use overlord::services::audit_log::{AuditLog, AuditLogConfig};
use overlord::services::event_bus::{EventBus, EventBusConfig};
use overlord::services::intent_classifier::IntentClassifier;
use overlord::services::policy_engine::{PolicyEngine, PolicyEngineConfig};

fn make_engine() -> PolicyEngine {
    PolicyEngine::with_default_rules(
        PolicyEngineConfig::default(),
        IntentClassifier::default(),
        Arc::new(AuditLog::new(AuditLogConfig::default())),
        Arc::new(EventBus::new(EventBusConfig::default())),
    )
}

fn bench_policy_eval(c: &mut Criterion) {
    let runtime = Runtime::new().expect("tokio runtime");
    let engine = make_engine();
    let safe = ToolCall::new("1", "bash", json!({"command": "git status"}));
    let forbidden = ToolCall::new("2", "bash", json!({"command": "rm -rf /tmp/x"}));
    let ctx = EvaluationContext {
        recent_messages: vec![Message::user("check git status and clean up")],
        interactive: true,
        user_role: None,
        recent_tool_calls: Vec::new(),
    };

    c.bench_function("evaluate_safe_prefix", |b| {
        b.to_async(&runtime).iter(|| async {
            let decision = engine.evaluate("bench", &safe, &ctx).await;
            assert!(decision.allowed);
        });
    });

    c.bench_function("evaluate_forbidden_condition", |b| {
        b.to_async(&runtime).iter(|| async {
            let decision = engine.evaluate("bench", &forbidden, &ctx).await;
            assert!(!decision.allowed);
        });
    });
}

criterion_group!(benches, bench_policy_eval);
criterion_main!(benches);
