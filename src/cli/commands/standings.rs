use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{load_config, standings_table, CheckpointView, StandingRow};
use crate::cli::output::{output, CommandOutput};

#[derive(Debug, Serialize)]
pub struct StandingsOutput {
    pub checkpoint: PathBuf,
    pub total: usize,
    pub standings: Vec<StandingRow>,
}

impl CommandOutput for StandingsOutput {
    fn to_human(&self) -> String {
        if self.standings.is_empty() {
            return "No hypotheses found.".to_string();
        }
        format!(
            "Showing {} of {} hypotheses:\n{}",
            self.standings.len(),
            self.total,
            standings_table(&self.standings)
        )
    }
}

pub async fn execute(
    config_path: Option<&Path>,
    checkpoint: Option<PathBuf>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let view = CheckpointView::open(&config, checkpoint).await?;
    let all = view.standings(usize::MAX).await?;

    let result = StandingsOutput {
        checkpoint: view.path.clone(),
        total: all.len(),
        standings: all.into_iter().take(limit).collect(),
    };
    output(&result, json);
    Ok(())
}
