use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{load_config, standings_table, CheckpointView, StandingRow};
use crate::cli::output::{list_table, number_cell, output, CommandOutput};
use crate::domain::models::{Statistics, TaskStatus};

const STATUSES: [TaskStatus; 6] = [
    TaskStatus::Pending,
    TaskStatus::Leased,
    TaskStatus::Running,
    TaskStatus::Retrying,
    TaskStatus::Succeeded,
    TaskStatus::Failed,
];

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub checkpoint: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Last statistics the supervisor published before the checkpoint
    pub statistics: Option<Statistics>,
    /// Task count per status as captured
    pub tasks: BTreeMap<String, usize>,
    pub leaders: Vec<StandingRow>,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Checkpoint:  {}", self.checkpoint.display()),
            format!("Created at:  {}", self.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
        ];

        match &self.statistics {
            Some(stats) => {
                lines.push(format!("State:       {}", stats.state));
                lines.push(format!("Elapsed:     {}s", stats.elapsed_secs));
                lines.push(format!(
                    "Hypotheses:  {} ({} active, {} superseded, {} excluded, {} unreviewed)",
                    stats.hypothesis_count,
                    stats.active_hypotheses,
                    stats.superseded_hypotheses,
                    stats.excluded_hypotheses,
                    stats.unreviewed_hypotheses
                ));
                lines.push(format!(
                    "Matches:     {} resolved, {} open, {:.0}% of pairs",
                    stats.tournament.resolved_matches,
                    stats.tournament.open_matches,
                    stats.tournament.completion_rate() * 100.0
                ));
                lines.push(format!(
                    "Workers:     {} configured, {} processed, {} failed",
                    stats.workers.configured, stats.workers.processed, stats.workers.failed
                ));
                if stats.storage_errors > 0 || stats.terminal_failures() > 0 {
                    lines.push(format!(
                        "Health:      {} storage errors, {} terminal failures",
                        stats.storage_errors,
                        stats.terminal_failures()
                    ));
                }
            }
            None => lines.push("State:       no statistics published yet".to_string()),
        }

        let mut tasks = list_table(&["status", "tasks"]);
        for (status, count) in &self.tasks {
            tasks.add_row(vec![comfy_table::Cell::new(status), number_cell(count)]);
        }
        lines.push(String::new());
        lines.push(tasks.to_string());

        lines.push(String::new());
        if self.leaders.is_empty() {
            lines.push("No hypotheses found.".to_string());
        } else {
            lines.push("Leaders:".to_string());
            lines.push(standings_table(&self.leaders).to_string());
        }
        lines.join("\n")
    }
}

pub async fn execute(config_path: Option<&Path>, checkpoint: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let view = CheckpointView::open(&config, checkpoint).await?;

    let statistics = view
        .statistics
        .latest()
        .await
        .context("Failed to read published statistics")?;
    let tasks = STATUSES
        .iter()
        .map(|s| (s.as_str().to_string(), view.checkpoint.task_count(*s)))
        .collect();
    let leaders = view
        .standings(config.supervisor.convergence.top_n)
        .await?;

    let result = StatusOutput {
        checkpoint: view.path.clone(),
        created_at: view.checkpoint.created_at,
        statistics,
        tasks,
        leaders,
    };
    output(&result, json);
    Ok(())
}
