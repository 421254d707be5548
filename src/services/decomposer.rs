//! Smart decomposer: LLM-assisted task → validated DAG.
//!
//! The model is prompted with a structured schema; the response is
//! validated (types, complexity bounds, dependency indices), cycles are
//! a hard error, and each task's `wave` is its longest dependency path
//! length. Tasks whose files overlap an earlier task's are annotated so
//! the scheduler can prefer sequential ordering.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::error::{ProviderError, RuntimeError};
use crate::domain::models::message::Message;
use crate::domain::models::swarm::{SwarmTask, SwarmTaskType};
use crate::domain::ports::provider::{ChatOptions, ModelProvider};
use crate::services::cancellation::CancellationToken;

/// Decomposer options.
#[derive(Debug, Clone)]
pub struct DecomposerConfig {
    pub model: String,
    /// Hard cap on subtask count; responses beyond it are rejected.
    pub max_subtasks: usize,
    pub max_tokens: u32,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self { model: "claude-sonnet-4-20250514".to_string(), max_subtasks: 12, max_tokens: 4096 }
    }
}

/// A validated decomposition.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub subtasks: Vec<SwarmTask>,
    pub strategy: String,
    pub token_usage: u64,
}

#[derive(Deserialize)]
struct RawDecomposition {
    #[serde(default)]
    strategy: String,
    subtasks: Vec<RawSubtask>,
}

#[derive(Deserialize)]
struct RawSubtask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default = "default_complexity")]
    complexity: f64,
    #[serde(default)]
    dependencies: Vec<usize>,
    #[serde(default)]
    relevant_files: Vec<String>,
}

const fn default_complexity() -> f64 {
    5.0
}

/// LLM-assisted decomposer.
pub struct SmartDecomposer {
    provider: Arc<dyn ModelProvider>,
    config: DecomposerConfig,
}

impl SmartDecomposer {
    pub fn new(provider: Arc<dyn ModelProvider>, config: DecomposerConfig) -> Self {
        Self { provider, config }
    }

    /// Decompose a task description into a sealed DAG.
    pub async fn decompose(
        &self,
        description: &str,
        context: &str,
        token: &CancellationToken,
    ) -> Result<Decomposition, RuntimeError> {
        let prompt = format!(
            "Decompose the following task into subtasks for a worker swarm.\n\n\
             TASK: {description}\n\nCONTEXT:\n{context}\n\n\
             Respond with exactly one JSON object:\n\
             {{\n  \"strategy\": \"<one sentence>\",\n  \"subtasks\": [\n    {{\n      \
             \"title\": \"<short>\",\n      \"description\": \"<what to do>\",\n      \
             \"type\": \"design|implement|test|refactor|research|analysis|document|merge\",\n      \
             \"complexity\": <1-10>,\n      \"dependencies\": [<indices of earlier subtasks>],\n      \
             \"relevant_files\": [\"<path>\"]\n    }}\n  ]\n}}\n\
             Keep it under {} subtasks. Dependencies reference subtasks by zero-based index.",
            self.config.max_subtasks
        );

        let options = ChatOptions::new(self.config.model.clone())
            .with_system_text("You plan work for a swarm of coding agents. Output only JSON.");
        let messages = vec![Message::user(prompt)];
        let response = self
            .provider
            .chat(&messages, &options, token)
            .await
            .map_err(RuntimeError::Provider)?;

        let raw = parse_decomposition(&response.content).map_err(|reason| {
            RuntimeError::Provider(ProviderError::InvalidResponse(reason))
        })?;

        let subtasks = self.validate(raw.subtasks, description)?;
        info!(count = subtasks.len(), "task decomposed");
        Ok(Decomposition {
            subtasks,
            strategy: raw.strategy,
            token_usage: response.usage.total(),
        })
    }

    fn validate(&self, raw: Vec<RawSubtask>, root: &str) -> Result<Vec<SwarmTask>, RuntimeError> {
        if raw.is_empty() {
            return Err(RuntimeError::Provider(ProviderError::InvalidResponse(
                "decomposition contains no subtasks".to_string(),
            )));
        }
        if raw.len() > self.config.max_subtasks {
            return Err(RuntimeError::Provider(ProviderError::InvalidResponse(format!(
                "decomposition has {} subtasks, cap is {}",
                raw.len(),
                self.config.max_subtasks
            ))));
        }

        let ids: Vec<Uuid> = raw.iter().map(|_| Uuid::new_v4()).collect();
        let mut tasks = Vec::with_capacity(raw.len());

        for (index, sub) in raw.iter().enumerate() {
            let task_type = SwarmTaskType::parse_str(&sub.task_type).ok_or_else(|| {
                RuntimeError::Provider(ProviderError::InvalidResponse(format!(
                    "unknown subtask type '{}'",
                    sub.task_type
                )))
            })?;

            let mut dependencies = Vec::new();
            for &dep in &sub.dependencies {
                if dep >= raw.len() || dep == index {
                    return Err(RuntimeError::Provider(ProviderError::InvalidResponse(format!(
                        "subtask {index} has invalid dependency index {dep}"
                    ))));
                }
                dependencies.push(ids[dep]);
            }

            let description = if sub.description.is_empty() {
                sub.title.clone()
            } else {
                format!("{}: {}", sub.title, sub.description)
            };

            let mut task = SwarmTask::new(description, task_type)
                .with_complexity(sub.complexity.round().clamp(1.0, 10.0) as u8)
                .with_dependencies(dependencies);
            task.id = ids[index];
            task.relevant_files = sub.relevant_files.clone();
            tasks.push(task);
        }

        assign_waves(&mut tasks)?;
        annotate_file_conflicts(&mut tasks);
        debug!(root, waves = tasks.iter().map(|t| t.wave).max().unwrap_or(0), "DAG sealed");
        Ok(tasks)
    }
}

/// Strip fences/prose and parse the JSON object.
fn parse_decomposition(text: &str) -> Result<RawDecomposition, String> {
    let start = text.find('{').ok_or("no JSON object in decomposition response")?;
    let end = text.rfind('}').ok_or("no JSON object in decomposition response")?;
    if end <= start {
        return Err("malformed JSON in decomposition response".to_string());
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| format!("decomposition parse error: {e}"))
}

/// Compute `wave` as the longest dependency path length via Kahn's
/// algorithm. A leftover node means a cycle, which is a hard error.
pub fn assign_waves(tasks: &mut [SwarmTask]) -> Result<(), RuntimeError> {
    let index_of: HashMap<Uuid, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut indegree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            let Some(&j) = index_of.get(dep) else {
                return Err(RuntimeError::CyclicDependency(task.id));
            };
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut queue: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| (d == 0).then_some(i))
        .collect();
    let mut waves = vec![0u32; tasks.len()];
    let mut visited = 0;

    while let Some(i) = queue.pop() {
        visited += 1;
        for &j in &dependents[i] {
            waves[j] = waves[j].max(waves[i] + 1);
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push(j);
            }
        }
    }

    if visited != tasks.len() {
        let culprit = indegree
            .iter()
            .position(|&d| d > 0)
            .map_or_else(Uuid::new_v4, |i| tasks[i].id);
        return Err(RuntimeError::CyclicDependency(culprit));
    }

    for (task, wave) in tasks.iter_mut().zip(waves) {
        task.wave = wave;
    }
    Ok(())
}

/// Mark tasks whose `relevant_files` overlap an earlier, independent
/// task's files so the scheduler can prefer sequential ordering.
fn annotate_file_conflicts(tasks: &mut [SwarmTask]) {
    let snapshots: Vec<(Uuid, Vec<String>, Vec<Uuid>)> = tasks
        .iter()
        .map(|t| (t.id, t.relevant_files.clone(), t.dependencies.clone()))
        .collect();

    for (i, task) in tasks.iter_mut().enumerate() {
        for (id, files, _) in snapshots.iter().take(i) {
            if task.dependencies.contains(id) {
                continue;
            }
            let overlaps = task.relevant_files.iter().any(|f| files.contains(f));
            if overlaps {
                task.conflicts_with.push(*id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decomposition_with_fences() {
        let text = r#"Sure, here is the plan:
```json
{"strategy": "bottom-up", "subtasks": [
  {"title": "design", "description": "sketch the API", "type": "design", "complexity": 3,
   "dependencies": [], "relevant_files": []}
]}
```"#;
        let raw = parse_decomposition(text).unwrap();
        assert_eq!(raw.strategy, "bottom-up");
        assert_eq!(raw.subtasks.len(), 1);
    }

    #[test]
    fn test_assign_waves_chain() {
        let a = SwarmTask::new("a", SwarmTaskType::Design);
        let b = SwarmTask::new("b", SwarmTaskType::Implement).with_dependencies(vec![a.id]);
        let c = SwarmTask::new("c", SwarmTaskType::Test).with_dependencies(vec![b.id]);
        let mut tasks = vec![a, b, c];
        assign_waves(&mut tasks).unwrap();
        assert_eq!(tasks[0].wave, 0);
        assert_eq!(tasks[1].wave, 1);
        assert_eq!(tasks[2].wave, 2);
    }

    #[test]
    fn test_assign_waves_diamond_longest_path() {
        let a = SwarmTask::new("a", SwarmTaskType::Design);
        let b = SwarmTask::new("b", SwarmTaskType::Implement).with_dependencies(vec![a.id]);
        let c = SwarmTask::new("c", SwarmTaskType::Implement).with_dependencies(vec![a.id, b.id]);
        let d = SwarmTask::new("d", SwarmTaskType::Merge).with_dependencies(vec![b.id, c.id]);
        let mut tasks = vec![a, b, c, d];
        assign_waves(&mut tasks).unwrap();
        assert_eq!(tasks[3].wave, 3); // a → b → c → d is the longest path
    }

    #[test]
    fn test_cycle_is_hard_error() {
        let mut a = SwarmTask::new("a", SwarmTaskType::Implement);
        let mut b = SwarmTask::new("b", SwarmTaskType::Implement);
        let (a_id, b_id) = (a.id, b.id);
        a.dependencies = vec![b_id];
        b.dependencies = vec![a_id];
        let mut tasks = vec![a, b];
        assert!(matches!(assign_waves(&mut tasks), Err(RuntimeError::CyclicDependency(_))));
    }

    #[test]
    fn test_conflict_annotation_skips_dependencies() {
        let mut a = SwarmTask::new("a", SwarmTaskType::Implement);
        a.relevant_files = vec!["src/lib.rs".to_string()];
        let mut b = SwarmTask::new("b", SwarmTaskType::Implement).with_dependencies(vec![a.id]);
        b.relevant_files = vec!["src/lib.rs".to_string()];
        let mut c = SwarmTask::new("c", SwarmTaskType::Refactor);
        c.relevant_files = vec!["src/lib.rs".to_string()];

        let mut tasks = vec![a, b, c];
        annotate_file_conflicts(&mut tasks);
        // b depends on a, so no conflict; c is independent and overlaps both.
        assert!(tasks[1].conflicts_with.is_empty());
        assert_eq!(tasks[2].conflicts_with.len(), 2);
    }

    #[tokio::test]
    async fn test_decompose_via_scripted_provider() {
        use crate::infrastructure::provider::mock::MockProvider;
        use crate::services::cancellation::CancellationSource;

        let plan = r#"{"strategy": "pipeline", "subtasks": [
            {"title": "design parser", "description": "sketch grammar", "type": "design",
             "complexity": 3, "dependencies": [], "relevant_files": ["src/parser.rs"]},
            {"title": "implement parser", "description": "write it", "type": "implement",
             "complexity": 7, "dependencies": [0], "relevant_files": ["src/parser.rs"]},
            {"title": "add tests", "description": "unit tests", "type": "test",
             "complexity": 4, "dependencies": [1], "relevant_files": ["src/parser.rs"]}
        ]}"#;
        let provider = Arc::new(MockProvider::with_text_responses(vec![plan.to_string()]));
        let decomposer = SmartDecomposer::new(provider, DecomposerConfig::default());
        let source = CancellationSource::new();

        let decomposition = decomposer
            .decompose("Implement parser and add tests", "", &source.token())
            .await
            .unwrap();

        assert_eq!(decomposition.subtasks.len(), 3);
        assert_eq!(decomposition.strategy, "pipeline");
        assert_eq!(decomposition.subtasks[0].wave, 0);
        assert_eq!(decomposition.subtasks[2].wave, 2);
        assert_eq!(decomposition.subtasks[1].dependencies, vec![decomposition.subtasks[0].id]);
    }

    #[tokio::test]
    async fn test_invalid_dependency_index_rejected() {
        use crate::infrastructure::provider::mock::MockProvider;
        use crate::services::cancellation::CancellationSource;

        let plan = r#"{"strategy": "x", "subtasks": [
            {"title": "a", "type": "implement", "dependencies": [5]}
        ]}"#;
        let provider = Arc::new(MockProvider::with_text_responses(vec![plan.to_string()]));
        let decomposer = SmartDecomposer::new(provider, DecomposerConfig::default());
        let source = CancellationSource::new();

        let result = decomposer.decompose("task", "", &source.token()).await;
        assert!(matches!(result, Err(RuntimeError::Provider(ProviderError::InvalidResponse(_)))));
    }
}
