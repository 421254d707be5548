//! Terminal rendering for run and swarm results.

use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};
use console::style;

use crate::domain::models::swarm::{SwarmResult, SwarmTaskStatus};

/// Render the swarm result as a task table plus a summary line.
pub fn render_swarm_result(result: &SwarmResult) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["wave", "type", "status", "attempts", "score", "task"]);

    let mut tasks = result.tasks.clone();
    tasks.sort_by_key(|t| (t.wave, t.created_at));
    for task in &tasks {
        let score = result
            .results
            .iter()
            .rev()
            .find(|r| r.task_id == task.id)
            .and_then(|r| r.quality_score)
            .map_or_else(|| "-".to_string(), |s| format!("{s:.1}"));
        let status_cell = Cell::new(task.status.to_string()).fg(status_color(task.status));
        let mut description = task.description.clone();
        if description.len() > 60 {
            description.truncate(57);
            description.push_str("...");
        }
        table.add_row(vec![
            Cell::new(task.wave),
            Cell::new(task.task_type.to_string()),
            status_cell,
            Cell::new(task.attempts),
            Cell::new(score),
            Cell::new(description),
        ]);
    }

    let summary = format!(
        "{} completed, {} failed, {} skipped | {} tokens, ${:.2}, {:.1}s{}",
        style(result.completed_count()).green(),
        style(result.failed_count()).red(),
        style(result.skipped_count()).yellow(),
        result.total_tokens,
        result.total_cost_usd,
        result.duration_ms as f64 / 1000.0,
        if result.cancelled { " (cancelled)" } else { "" },
    );

    format!("{table}\n{summary}")
}

fn status_color(status: SwarmTaskStatus) -> Color {
    match status {
        SwarmTaskStatus::Completed => Color::Green,
        SwarmTaskStatus::Failed => Color::Red,
        SwarmTaskStatus::Skipped => Color::Yellow,
        _ => Color::White,
    }
}
