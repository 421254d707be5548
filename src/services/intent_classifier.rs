//! Intent classifier: weighted evidence about whether a tool call was
//! deliberately requested.
//!
//! Evidence weights sum and pass through a logistic squash,
//! `clamp(σ(Σw), 0, 1)` with `σ(x) = 1 / (1 + e^(−2x))`. Type is chosen
//! by thresholding the composite: ≥ 0.8 deliberate, 0.4–0.8 inferred,
//! < 0.4 accidental; no evidence at all is unknown. The thresholds are
//! configurable; the ordering and monotonicity are invariants.

use serde_json::Value;

use crate::domain::models::intent::{Evidence, EvidenceKind, IntentClassification, IntentType};
use crate::domain::models::message::{Message, Role, ToolCall};
use crate::domain::models::policy::EvaluationContext;

/// Classifier thresholds and scan window.
#[derive(Debug, Clone)]
pub struct IntentClassifierConfig {
    /// Composite confidence at or above which intent is deliberate.
    pub deliberate_threshold: f64,
    /// Composite confidence below which intent is accidental.
    pub accidental_threshold: f64,
    /// How many recent messages to scan for evidence.
    pub scan_window: usize,
    /// Gain applied inside the logistic squash.
    pub squash_gain: f64,
}

impl Default for IntentClassifierConfig {
    fn default() -> Self {
        Self {
            deliberate_threshold: 0.8,
            accidental_threshold: 0.4,
            scan_window: 10,
            squash_gain: 2.0,
        }
    }
}

/// Gathers weighted evidence from the recent conversation and composes
/// a confidence. Pure and synchronous.
pub struct IntentClassifier {
    config: IntentClassifierConfig,
}

impl IntentClassifier {
    pub fn new(config: IntentClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify one tool call against the recent conversation.
    pub fn classify(&self, call: &ToolCall, ctx: &EvaluationContext) -> IntentClassification {
        let user_texts = self.recent_user_texts(ctx);
        let mut evidence = Vec::new();

        if let Some(e) = explicit_request(call, &user_texts) {
            evidence.push(e);
        }
        if let Some(e) = keyword_match(call, &user_texts) {
            evidence.push(e);
        }
        if let Some(e) = context_flow(call, ctx) {
            evidence.push(e);
        }
        if let Some(e) = pattern_match(call, ctx) {
            evidence.push(e);
        }
        if let Some(e) = hallucination_sign(call, ctx, &user_texts) {
            evidence.push(e);
        }
        if let Some(e) = contradiction(call, &user_texts) {
            evidence.push(e);
        }

        if evidence.is_empty() {
            return IntentClassification::unknown();
        }

        let sum: f64 = evidence.iter().map(|e| e.weight).sum();
        let confidence = squash(sum, self.config.squash_gain).clamp(0.0, 1.0);
        let intent_type = if confidence >= self.config.deliberate_threshold {
            IntentType::Deliberate
        } else if confidence >= self.config.accidental_threshold {
            IntentType::Inferred
        } else {
            IntentType::Accidental
        };

        IntentClassification { intent_type, confidence, evidence }
    }

    fn recent_user_texts(&self, ctx: &EvaluationContext) -> Vec<String> {
        ctx.recent_messages
            .iter()
            .rev()
            .take(self.config.scan_window)
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_text().to_lowercase())
            .collect()
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(IntentClassifierConfig::default())
    }
}

/// Monotone logistic squash centred at 0.
fn squash(x: f64, gain: f64) -> f64 {
    1.0 / (1.0 + (-gain * x).exp())
}

/// The tool name split into lowercase tokens (`delete_file` → `delete`, `file`).
fn name_tokens(name: &str) -> Vec<String> {
    name.split(['_', '-', '.'])
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// String argument values worth matching against conversation text.
fn string_arg_values(call: &ToolCall) -> Vec<String> {
    call.arguments
        .as_object()
        .map(|map| {
            map.values()
                .filter_map(Value::as_str)
                .filter(|s| s.len() > 2)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

fn explicit_request(call: &ToolCall, user_texts: &[String]) -> Option<Evidence> {
    let name = call.name.to_lowercase();
    let tokens = name_tokens(&call.name);
    let verb = tokens.first().cloned().unwrap_or_default();
    let arg_values = string_arg_values(call);

    for text in user_texts {
        // The tool named verbatim.
        if text.contains(&name) {
            return Some(Evidence::new(
                EvidenceKind::ExplicitRequest,
                0.9,
                format!("user message names the tool '{}'", call.name),
            ));
        }
        // The action verb plus a concrete argument value.
        if !verb.is_empty()
            && text.contains(&verb)
            && arg_values.iter().any(|v| text.contains(v))
        {
            return Some(Evidence::new(
                EvidenceKind::ExplicitRequest,
                0.9,
                format!("user asked to {verb} a named target"),
            ));
        }
    }
    None
}

/// Keywords related to a tool, keyed off its name tokens.
fn keywords_for_tool(name: &str) -> Vec<&'static str> {
    let name = name.to_lowercase();
    let mut keywords = Vec::new();
    if name.contains("read") || name.contains("cat") || name.contains("view") {
        keywords.extend(["read", "show", "open", "view", "display", "contents"]);
    }
    if name.contains("write") || name.contains("save") {
        keywords.extend(["write", "save", "create"]);
    }
    if name.contains("edit") || name.contains("patch") {
        keywords.extend(["edit", "change", "modify", "update", "fix"]);
    }
    if name.contains("delete") || name.contains("remove") || name.contains("rm") {
        keywords.extend(["delete", "remove", "clean up"]);
    }
    if name.contains("bash") || name.contains("shell") || name.contains("exec") {
        keywords.extend(["run", "execute", "command", "install", "build", "test"]);
    }
    if name.contains("grep") || name.contains("search") || name.contains("find") {
        keywords.extend(["search", "find", "grep", "locate", "look for"]);
    }
    if name.contains("list") || name.contains("ls") {
        keywords.extend(["list", "what files", "directory", "folder"]);
    }
    keywords
}

fn keyword_match(call: &ToolCall, user_texts: &[String]) -> Option<Evidence> {
    let keywords = keywords_for_tool(&call.name);
    if keywords.is_empty() {
        return None;
    }
    let mut hits = 0;
    for keyword in &keywords {
        if user_texts.iter().any(|t| t.contains(keyword)) {
            hits += 1;
        }
    }
    match hits {
        0 => None,
        1 => Some(Evidence::new(
            EvidenceKind::KeywordMatch,
            0.6,
            "user message contains a related keyword".to_string(),
        )),
        _ => Some(Evidence::new(
            EvidenceKind::KeywordMatch,
            0.8,
            format!("user message contains {hits} related keywords"),
        )),
    }
}

fn context_flow(call: &ToolCall, ctx: &EvaluationContext) -> Option<Evidence> {
    let last_allowed = ctx.recent_tool_calls.iter().rev().find(|h| h.allowed)?;
    if last_allowed.tool == call.name {
        Some(Evidence::new(
            EvidenceKind::ContextFlow,
            0.6,
            format!("repeats previously allowed '{}'", call.name),
        ))
    } else {
        Some(Evidence::new(
            EvidenceKind::ContextFlow,
            0.4,
            format!("follows allowed '{}'", last_allowed.tool),
        ))
    }
}

/// Known follow-up pairs: `(previous tool, natural next tool)`.
const FOLLOW_UP_PATTERNS: &[(&str, &str)] = &[
    ("list_files", "read_file"),
    ("grep", "read_file"),
    ("search", "read_file"),
    ("read_file", "edit_file"),
    ("read_file", "write_file"),
    ("write_file", "bash"),
    ("edit_file", "bash"),
];

fn pattern_match(call: &ToolCall, ctx: &EvaluationContext) -> Option<Evidence> {
    let last_allowed = ctx.recent_tool_calls.iter().rev().find(|h| h.allowed)?;
    FOLLOW_UP_PATTERNS
        .iter()
        .find(|(prev, next)| *prev == last_allowed.tool && *next == call.name)
        .map(|(prev, next)| {
            Evidence::new(
                EvidenceKind::PatternMatch,
                0.3,
                format!("'{next}' is a known follow-up to '{prev}'"),
            )
        })
}

/// Path-like string arguments never mentioned in the conversation look
/// fabricated.
fn hallucination_sign(
    call: &ToolCall,
    ctx: &EvaluationContext,
    user_texts: &[String],
) -> Option<Evidence> {
    let all_text: String = ctx
        .recent_messages
        .iter()
        .map(|m: &Message| m.content.as_text().to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    for value in string_arg_values(call) {
        let path_like = value.contains('/') || value.contains('.');
        if !path_like {
            continue;
        }
        let mentioned = all_text.contains(&value) || user_texts.iter().any(|t| t.contains(&value));
        if !mentioned {
            return Some(Evidence::new(
                EvidenceKind::HallucinationSign,
                -0.7,
                format!("argument '{value}' appears nowhere in the conversation"),
            ));
        }
    }
    None
}

const NEGATIONS: &[&str] = &["don't", "do not", "never", "avoid", "stop"];

fn contradiction(call: &ToolCall, user_texts: &[String]) -> Option<Evidence> {
    let mut terms: Vec<String> = keywords_for_tool(&call.name).iter().map(|s| (*s).to_string()).collect();
    terms.extend(name_tokens(&call.name));

    for text in user_texts {
        for negation in NEGATIONS {
            let mut start = 0;
            while let Some(pos) = text[start..].find(negation) {
                let at = start + pos + negation.len();
                let tail: String = text[at..].chars().take(80).collect();
                if terms.iter().any(|t| tail.contains(t.as_str())) {
                    return Some(Evidence::new(
                        EvidenceKind::Contradiction,
                        -0.9,
                        format!("user said '{negation} ...' about this action"),
                    ));
                }
                start = at;
            }
        }
    }
    None
}
