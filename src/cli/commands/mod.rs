//! Command handlers.

pub mod config;
pub mod standings;
pub mod status;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapters::checkpoint::FileCheckpointStore;
use crate::adapters::memory::InMemoryContextStore;
use crate::domain::models::{Checkpoint, Config, Standing};
use crate::domain::ports::CheckpointStore;
use crate::infrastructure::config::ConfigLoader;
use crate::services::{Checkpointer, ContextMemory, StatisticsCollector, TaskQueue, Tournament};

use serde::Serialize;
use uuid::Uuid;

/// Effective configuration: an explicit file, or the layered project
/// config.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// A checkpoint restored into throwaway in-memory services so it can be
/// queried like a live system.
pub struct CheckpointView {
    pub path: PathBuf,
    pub checkpoint: Checkpoint,
    pub tournament: Arc<Tournament>,
    pub statistics: StatisticsCollector,
}

impl CheckpointView {
    pub async fn open(config: &Config, path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from(&config.storage.checkpoint_path));
        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(path.clone()));
        let checkpoint = store
            .load()
            .await
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?
            .ok_or_else(|| anyhow::anyhow!("No checkpoint found at {}", path.display()))?;

        let memory = ContextMemory::new(Arc::new(InMemoryContextStore::new()), &config.retry);
        let queue = Arc::new(TaskQueue::new(config.queue.clone(), config.retry.clone()));
        let tournament = Arc::new(Tournament::new(
            memory.clone(),
            queue.clone(),
            config.tournament.clone(),
        ));
        let statistics = StatisticsCollector::new(
            memory.clone(),
            queue.clone(),
            tournament.clone(),
            config.supervisor.convergence.top_n,
        );

        Checkpointer::new(memory, queue, store)
            .restore(&checkpoint)
            .await
            .context("Failed to load checkpoint state")?;

        Ok(Self {
            path,
            checkpoint,
            tournament,
            statistics,
        })
    }

    /// Leaderboard rows, best first.
    pub async fn standings(&self, limit: usize) -> Result<Vec<StandingRow>> {
        let standings = self
            .tournament
            .standings()
            .await
            .context("Failed to compute standings")?;
        Ok(standings.iter().take(limit).map(StandingRow::from).collect())
    }
}

/// One leaderboard line.
#[derive(Debug, Clone, Serialize)]
pub struct StandingRow {
    pub rank: usize,
    pub hypothesis_id: Uuid,
    pub status: String,
    pub source: String,
    pub elo_rating: f64,
    pub match_count: u32,
}

impl From<&Standing> for StandingRow {
    fn from(s: &Standing) -> Self {
        Self {
            rank: s.rank,
            hypothesis_id: s.hypothesis.id,
            status: s.hypothesis.status.as_str().to_string(),
            source: s.hypothesis.source.clone(),
            elo_rating: s.elo_rating,
            match_count: s.match_count,
        }
    }
}

pub(crate) fn standings_table(rows: &[StandingRow]) -> comfy_table::Table {
    use crate::cli::output::{list_table, number_cell, truncate};

    let mut table = list_table(&["rank", "hypothesis", "elo", "matches", "status", "source"]);
    for row in rows {
        table.add_row(vec![
            number_cell(row.rank),
            comfy_table::Cell::new(row.hypothesis_id),
            number_cell(format!("{:.1}", row.elo_rating)),
            number_cell(row.match_count),
            comfy_table::Cell::new(&row.status),
            comfy_table::Cell::new(truncate(&row.source, 24)),
        ]);
    }
    table
}
