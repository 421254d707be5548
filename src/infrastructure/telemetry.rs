//! Live swarm telemetry: append-only `events.jsonl`, an atomically
//! replaced `state.json`, and per-completed-task detail files under
//! `tasks/<id>.json`.
//!
//! Every event carries the bus's monotonically increasing `seq`;
//! consumers resume by reading events with `seq` greater than the last
//! one they saw.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::services::event_bus::{EventBus, EventPayload, RuntimeEvent, SwarmTaskBrief};

/// The mirrored `state.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveState {
    pub last_seq: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub tasks: Vec<SwarmTaskBrief>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Per-task detail document written on completion.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task_id: uuid::Uuid,
    pub output: String,
    pub quality_score: Option<f64>,
    pub quality_feedback: Option<String>,
    pub closure_report: Option<crate::domain::models::swarm::ClosureReport>,
}

/// Writes the live directory from a bus subscription.
pub struct TelemetryWriter {
    dir: PathBuf,
}

impl TelemetryWriter {
    /// Prepare the live directory (including `tasks/`).
    pub async fn create(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(dir.join("tasks"))
            .await
            .with_context(|| format!("failed to create telemetry dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Subscribe to the bus and mirror events until the bus is dropped.
    pub fn spawn(self, event_bus: &EventBus) -> JoinHandle<()> {
        let mut rx = event_bus.subscribe();
        tokio::spawn(async move {
            let mut state = LiveState::default();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(error) = self.handle(&mut state, &event).await {
                            warn!(%error, "telemetry write failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "telemetry lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle(&self, state: &mut LiveState, event: &RuntimeEvent) -> Result<()> {
        // 1. Append to the event log.
        let line = serde_json::to_string(event).context("failed to serialize event")?;
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("events.jsonl"))
            .await
            .context("failed to open events.jsonl")?;
        log.write_all(line.as_bytes()).await.context("failed to append event")?;
        log.write_all(b"\n").await.context("failed to append newline")?;

        // 2. Fold swarm lifecycle into the mirrored state.
        state.last_seq = event.seq;
        state.updated_at = Some(event.timestamp);
        match &event.payload {
            EventPayload::SwarmTasksLoaded { tasks } => {
                state.tasks = tasks.clone();
            }
            EventPayload::SwarmTaskCompleted {
                task_id,
                output,
                quality_score,
                quality_feedback,
                closure_report,
            } => {
                state.completed += 1;
                let detail = TaskDetail {
                    task_id: *task_id,
                    output: output.clone(),
                    quality_score: *quality_score,
                    quality_feedback: quality_feedback.clone(),
                    closure_report: closure_report.clone(),
                };
                let path = self.dir.join("tasks").join(format!("{task_id}.json"));
                tokio::fs::write(
                    &path,
                    serde_json::to_string_pretty(&detail).context("failed to serialize detail")?,
                )
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            }
            EventPayload::SwarmTaskFailed { .. } => state.failed += 1,
            EventPayload::SwarmTaskSkipped { .. } => state.skipped += 1,
            EventPayload::SwarmCompleted { cancelled, .. } => state.cancelled = *cancelled,
            _ => {}
        }

        // 3. Replace state.json atomically (write-then-rename).
        let tmp = self.dir.join("state.json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(state).context("state serialize")?)
            .await
            .context("failed to write state.json.tmp")?;
        tokio::fs::rename(&tmp, self.dir.join("state.json"))
            .await
            .context("failed to replace state.json")?;
        Ok(())
    }
}

/// Read all events with `seq > after_seq`, in order.
pub async fn read_events_since(dir: &Path, after_seq: u64) -> Result<Vec<RuntimeEvent>> {
    let path = dir.join("events.jsonl");
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error).context("failed to read events.jsonl"),
    };
    let mut events = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let event: RuntimeEvent =
            serde_json::from_str(line).context("failed to parse event line")?;
        if event.seq > after_seq {
            events.push(event);
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::{EventBusConfig, EventCategory, EventSeverity};
    use uuid::Uuid;

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_events_appended_with_seq() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(EventBusConfig::default());
        let writer = TelemetryWriter::create(dir.path().to_path_buf()).await.unwrap();
        let handle = writer.spawn(&bus);

        for i in 0..3 {
            bus.publish(
                EventSeverity::Info,
                EventCategory::Agent,
                EventPayload::AgentMessage { agent: "main".into(), content: format!("m{i}") },
            );
        }
        settle().await;
        drop(bus);
        handle.await.unwrap();

        let events = read_events_since(dir.path(), 0).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

        // Resume from the second event.
        let resumed = read_events_since(dir.path(), events[1].seq).await.unwrap();
        assert_eq!(resumed.len(), 1);
    }

    #[tokio::test]
    async fn test_state_and_task_detail_written() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(EventBusConfig::default());
        let writer = TelemetryWriter::create(dir.path().to_path_buf()).await.unwrap();
        let handle = writer.spawn(&bus);

        let task_id = Uuid::new_v4();
        bus.publish(
            EventSeverity::Info,
            EventCategory::Swarm,
            EventPayload::SwarmTaskCompleted {
                task_id,
                output: "the parser works".to_string(),
                quality_score: Some(4.0),
                quality_feedback: Some("good".to_string()),
                closure_report: None,
            },
        );
        settle().await;
        drop(bus);
        handle.await.unwrap();

        let state: LiveState = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("state.json")).await.unwrap(),
        )
        .unwrap();
        assert_eq!(state.completed, 1);
        assert!(state.last_seq > 0);

        let detail: TaskDetail = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("tasks").join(format!("{task_id}.json")))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(detail.output, "the parser works");
        assert_eq!(detail.quality_score, Some(4.0));
    }

    #[tokio::test]
    async fn test_read_events_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let events = read_events_since(dir.path(), 0).await.unwrap();
        assert!(events.is_empty());
    }
}
