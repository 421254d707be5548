//! Tiered worker prompts.
//!
//! First attempts get the full scaffold; retries get progressively less
//! so the retry context dominates. Prompt length strictly decreases
//! across tiers for the same inputs. Task-type rule blocks are mutually
//! exclusive.

use crate::domain::models::swarm::{RetryContext, SwarmTask, SwarmTaskType, WorkerRole};

/// How much scaffolding a worker prompt carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTier {
    Full,
    Reduced,
    Minimal,
}

impl PromptTier {
    /// Tier by attempt count: 0 → full, 1 → reduced, ≥ 2 → minimal.
    pub fn for_attempts(attempts: u32) -> Self {
        match attempts {
            0 => Self::Full,
            1 => Self::Reduced,
            _ => Self::Minimal,
        }
    }
}

/// Builds tiered system prompts for dispatched workers.
#[derive(Debug, Clone)]
pub struct WorkerPromptBuilder {
    persona: String,
    philosophy: String,
    environment_facts: Vec<String>,
    delegation_spec: String,
}

impl Default for WorkerPromptBuilder {
    fn default() -> Self {
        Self {
            persona: "You are a focused specialist worker inside an agent swarm. You do one \
                      task well and report precisely."
                .to_string(),
            philosophy: "PHILOSOPHY: prefer small verifiable steps; state assumptions; never \
                         invent files or APIs; when blocked, say exactly what is missing."
                .to_string(),
            environment_facts: vec![
                "The workspace is a single checked-out repository.".to_string(),
                "Shared discoveries live on the blackboard; check it before re-deriving.".to_string(),
                "Tool calls are policy-gated; a blocked call returns an explanation.".to_string(),
            ],
            delegation_spec: "DELEGATION: you may not spawn further workers. Finish your task \
                              and end with a CLOSURE REPORT JSON object: {\"findings\": [], \
                              \"actions_taken\": [], \"failures\": [], \"remaining_work\": []}."
                .to_string(),
        }
    }
}

impl WorkerPromptBuilder {
    pub fn with_environment_fact(mut self, fact: impl Into<String>) -> Self {
        self.environment_facts.push(fact.into());
        self
    }

    /// Build the system prompt for one dispatch attempt.
    pub fn build(&self, role: &WorkerRole, task: &SwarmTask) -> String {
        let tier = PromptTier::for_attempts(task.attempts);
        let mut sections: Vec<String> = Vec::new();

        if tier == PromptTier::Full || tier == PromptTier::Reduced {
            sections.push(self.persona.clone());
        }

        let mut capabilities: Vec<String> =
            role.capabilities.iter().map(|c| format!("{c:?}").to_lowercase()).collect();
        capabilities.sort();
        sections.push(format!(
            "WORKER: {} - {}. Capabilities: {}.",
            role.name,
            role.description,
            capabilities.join(", ")
        ));

        if tier == PromptTier::Full || tier == PromptTier::Reduced {
            sections.push(self.philosophy.clone());
        }

        sections.push(task_type_rules(task.task_type).to_string());

        match tier {
            PromptTier::Full => {
                sections.push(format!("ENVIRONMENT:\n- {}", self.environment_facts.join("\n- ")));
                sections.push(self.delegation_spec.clone());
            }
            PromptTier::Reduced => {
                sections.push(format!("ENVIRONMENT: {}", self.environment_facts.join(" ")));
            }
            PromptTier::Minimal => {}
        }

        if tier == PromptTier::Full {
            sections.push(format!("TASK: {}", task.description));
            if !task.relevant_files.is_empty() {
                sections.push(format!("RELEVANT FILES: {}", task.relevant_files.join(", ")));
            }
        } else {
            sections.push(format!("TASK: {}", task.description));
        }

        if let Some(retry) = &task.retry_context {
            sections.push(retry_block(retry));
        }

        sections.join("\n\n")
    }
}

/// Mutually exclusive rule block per task type.
fn task_type_rules(task_type: SwarmTaskType) -> &'static str {
    match task_type {
        SwarmTaskType::Implement | SwarmTaskType::Refactor | SwarmTaskType::Test => {
            "ANTI-LOOP RULES: Do NOT run ls/find/tree to re-explore; the relevant files are \
             listed. START CODING IMMEDIATELY. Re-reading the same file twice is a bug."
        }
        SwarmTaskType::Research | SwarmTaskType::Analysis | SwarmTaskType::Design => {
            "RESEARCH TASK RULES: You are NOT expected to write or edit code. Produce findings \
             as structured notes; cite the files and lines you relied on."
        }
        SwarmTaskType::Merge => {
            "SYNTHESIS TASK RULES: Do NOT re-research; do NOT run web_search. Combine the \
             dependency outputs you were given into one coherent result."
        }
        SwarmTaskType::Document => {
            "DOCUMENTATION TASK RULES: Write for a reader who has not seen the code. Document \
             behaviour, not implementation history. Keep examples runnable."
        }
    }
}

/// Retry context is always included when present.
fn retry_block(retry: &RetryContext) -> String {
    if retry.previous_score == 0.0 {
        format!(
            "RETRY CONTEXT (attempt {}): previous attempt FAILED with error: {}",
            retry.attempt + 1,
            retry.previous_feedback
        )
    } else {
        format!(
            "RETRY CONTEXT (attempt {}): Previous attempt scored {:.1}/5: {}",
            retry.attempt + 1,
            retry.previous_score,
            retry.previous_feedback
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::swarm::Capability;

    fn make_role() -> WorkerRole {
        WorkerRole::new("coder", "implements features")
            .with_capability(Capability::Code)
            .with_authority(2)
    }

    fn make_task(attempts: u32, retry: Option<RetryContext>) -> SwarmTask {
        let mut task = SwarmTask::new("implement the parser", SwarmTaskType::Implement);
        task.attempts = attempts;
        task.retry_context = retry;
        task.relevant_files = vec!["src/parser.rs".to_string()];
        task
    }

    #[test]
    fn test_tier_by_attempts() {
        assert_eq!(PromptTier::for_attempts(0), PromptTier::Full);
        assert_eq!(PromptTier::for_attempts(1), PromptTier::Reduced);
        assert_eq!(PromptTier::for_attempts(2), PromptTier::Minimal);
        assert_eq!(PromptTier::for_attempts(7), PromptTier::Minimal);
    }

    #[test]
    fn test_full_tier_has_all_sections() {
        let builder = WorkerPromptBuilder::default();
        let prompt = builder.build(&make_role(), &make_task(0, None));
        assert!(prompt.contains("PHILOSOPHY"));
        assert!(prompt.contains("ENVIRONMENT:"));
        assert!(prompt.contains("DELEGATION"));
        assert!(prompt.contains("ANTI-LOOP RULES"));
        assert!(prompt.contains("RELEVANT FILES"));
        assert!(!prompt.contains("RETRY CONTEXT"));
    }

    #[test]
    fn test_minimal_tier_is_stripped() {
        let builder = WorkerPromptBuilder::default();
        let retry = RetryContext {
            previous_feedback: "missing error handling".into(),
            previous_score: 2.0,
            attempt: 1,
        };
        let prompt = builder.build(&make_role(), &make_task(2, Some(retry)));
        assert!(!prompt.contains("PHILOSOPHY"));
        assert!(!prompt.contains("ENVIRONMENT"));
        assert!(!prompt.contains("DELEGATION"));
        assert!(prompt.contains("ANTI-LOOP RULES"));
        assert!(prompt.contains("RETRY CONTEXT"));
    }

    #[test]
    fn test_prompt_length_strictly_decreases_across_tiers() {
        let builder = WorkerPromptBuilder::default();
        let retry = RetryContext {
            previous_feedback: "same feedback".into(),
            previous_score: 2.0,
            attempt: 0,
        };
        let full = builder.build(&make_role(), &make_task(0, Some(retry.clone())));
        let reduced = builder.build(&make_role(), &make_task(1, Some(retry.clone())));
        let minimal = builder.build(&make_role(), &make_task(2, Some(retry)));
        assert!(full.len() > reduced.len());
        assert!(reduced.len() > minimal.len());
    }

    #[test]
    fn test_task_type_blocks_are_mutually_exclusive() {
        let builder = WorkerPromptBuilder::default();
        let role = make_role();

        let mut research = SwarmTask::new("investigate crates", SwarmTaskType::Research);
        research.attempts = 0;
        let prompt = builder.build(&role, &research);
        assert!(prompt.contains("RESEARCH TASK RULES"));
        assert!(!prompt.contains("ANTI-LOOP RULES"));
        assert!(!prompt.contains("SYNTHESIS TASK RULES"));

        let merge = SwarmTask::new("combine outputs", SwarmTaskType::Merge);
        let prompt = builder.build(&role, &merge);
        assert!(prompt.contains("SYNTHESIS TASK RULES"));
        assert!(prompt.contains("web_search"));
        assert!(!prompt.contains("RESEARCH TASK RULES"));
    }

    #[test]
    fn test_retry_block_quality_vs_hard_failure() {
        let scored = retry_block(&RetryContext {
            previous_feedback: "too shallow".into(),
            previous_score: 2.0,
            attempt: 0,
        });
        assert!(scored.contains("scored 2.0/5"));

        let failed = retry_block(&RetryContext {
            previous_feedback: "worker panicked".into(),
            previous_score: 0.0,
            attempt: 1,
        });
        assert!(failed.contains("FAILED with error: worker panicked"));
    }
}
