//! Intent classification model: weighted evidence about whether a tool
//! call was deliberately requested, inferred from context, or accidental.

use serde::{Deserialize, Serialize};

/// Classification outcome, chosen by thresholding the composite confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    /// The user explicitly asked for this action.
    Deliberate,
    /// A plausible follow-up to the conversation.
    Inferred,
    /// Likely a hallucination or misfire.
    Accidental,
    /// No evidence either way.
    Unknown,
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deliberate => write!(f, "deliberate"),
            Self::Inferred => write!(f, "inferred"),
            Self::Accidental => write!(f, "accidental"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Kind of evidence contributing to a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// User message explicitly names the tool or action.
    ExplicitRequest,
    /// User message contains related keywords.
    KeywordMatch,
    /// Logical follow-up to previously allowed actions.
    ContextFlow,
    /// Matches a known intent pattern for that tool.
    PatternMatch,
    /// Arguments look fabricated (implausible paths, invented identifiers).
    HallucinationSign,
    /// Argument contradicts a user constraint stated recently.
    Contradiction,
}

/// One weighted piece of evidence. Weights are in `[-1, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub weight: f64,
    pub description: String,
}

impl Evidence {
    pub fn new(kind: EvidenceKind, weight: f64, description: impl Into<String>) -> Self {
        Self { kind, weight, description: description.into() }
    }
}

/// Composite classification: the clamped squash of summed evidence weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    /// Composite confidence in `[0, 1]`.
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
}

impl IntentClassification {
    /// The no-evidence classification. Confidence sits at the squash's
    /// neutral point so unknown intent prompts rather than blocks.
    pub fn unknown() -> Self {
        Self { intent_type: IntentType::Unknown, confidence: 0.5, evidence: Vec::new() }
    }
}
