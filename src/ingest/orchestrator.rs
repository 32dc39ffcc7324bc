// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Drives one ingestion run through its states.
//!
//! ```text
//! Idle -> Planning -> Splitting -> Decoding -> Merging -> Completed
//!              \____________\___________\_________\_____-> Failed
//! ```
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, PlannerConfig, ToolsConfig};
use crate::ingest::merger::{MergePolicy, Merger};
use crate::ingest::planner::{ChunkPlan, ChunkPlanner};
use crate::ingest::pool::{PoolStats, StringPool};
use crate::ingest::record::PacketRecord;
use crate::ingest::runner::{ChunkOutput, DecoderRunner};
use crate::ingest::splitter::{sanitize_input_path, ChunkSet, Splitter};
use crate::ingest::tool::ToolLauncher;
use crate::ingest::PipelineError;
use crate::metrics::{CHUNKS, INGEST_RUNS, INTERNED_STRINGS};
use crate::util::human_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    Planning,
    Splitting,
    Decoding,
    Merging,
    Completed,
    Failed,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestState::Idle => "idle",
            IngestState::Planning => "planning",
            IngestState::Splitting => "splitting",
            IngestState::Decoding => "decoding",
            IngestState::Merging => "merging",
            IngestState::Completed => "completed",
            IngestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a run needs from the configuration, with durations already parsed.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub planner: PlannerConfig,
    pub tools: ToolsConfig,
    pub temp_dir: Option<PathBuf>,
    pub chunk_timeout: Duration,
    pub split_timeout: Duration,
    pub max_malformed_ratio: f64,
    pub merge_policy: MergePolicy,
    pub force_chunks: Option<usize>,
    /// Overrides the detected core count.
    pub cores: Option<usize>,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let ingest = &config.ingest;
        Ok(Self {
            planner: ingest.planner.clone(),
            tools: ingest.tools.clone(),
            temp_dir: ingest.temp_dir.clone(),
            chunk_timeout: config.get_chunk_timeout()?,
            split_timeout: config.get_split_timeout()?,
            max_malformed_ratio: ingest.max_malformed_ratio,
            merge_policy: MergePolicy::new(config.get_max_timestamp_regression()?),
            force_chunks: ingest.force_chunks,
            cores: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub file_size: u64,
    pub total_records: u64,
    pub total_lines: u64,
    pub malformed_lines: u64,
    pub chunk_count: usize,
    pub max_concurrent: usize,
    pub interned_strings: usize,
    pub pool: PoolStats,
    pub elapsed: Duration,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records from {} decoder lines ({} malformed), {} of input in {} chunks \
             ({} concurrent), {} interned strings, {:.2?}",
            self.total_records,
            self.total_lines,
            self.malformed_lines,
            human_bytes(self.file_size),
            self.chunk_count,
            self.max_concurrent,
            self.interned_strings,
            self.elapsed
        )
    }
}

#[derive(Debug)]
pub struct IngestOutput {
    pub records: Vec<PacketRecord>,
    pub summary: IngestSummary,
}

pub struct IngestOrchestrator {
    settings: IngestSettings,
    launcher: Arc<dyn ToolLauncher>,
    state: watch::Sender<IngestState>,
}

impl IngestOrchestrator {
    pub fn new(settings: IngestSettings, launcher: Arc<dyn ToolLauncher>) -> Self {
        Self {
            settings,
            launcher,
            state: watch::Sender::new(IngestState::Idle),
        }
    }

    pub fn from_config(config: &Config, launcher: Arc<dyn ToolLauncher>) -> Result<Self, ConfigError> {
        Ok(Self::new(IngestSettings::from_config(config)?, launcher))
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn state(&self) -> IngestState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<IngestState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: IngestState) {
        debug!("ingest state: {state}");
        self.state.send_replace(state);
    }

    /// Plans the run for `path` without touching any tool.
    pub fn plan(&self, path: &Path) -> Result<ChunkPlan, PipelineError> {
        let (_, size) = validate_input(path)?;
        self.plan_size(size)
    }

    fn plan_size(&self, size: u64) -> Result<ChunkPlan, PipelineError> {
        let planner = match self.settings.cores {
            Some(cores) => ChunkPlanner::with_cores(self.settings.planner.clone(), cores),
            None => ChunkPlanner::new(self.settings.planner.clone()),
        };
        match self.settings.force_chunks {
            Some(chunks) => planner.forced(chunks, size),
            None => planner.plan(size),
        }
    }

    /// Ingests `path`. Temporary chunk files and decoder processes are gone when this returns.
    pub async fn run(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestOutput, PipelineError> {
        let started = Instant::now();
        let result = self.execute(path, cancel, started).await;
        match &result {
            Ok(output) => {
                self.set_state(IngestState::Completed);
                INGEST_RUNS.with_label_values(&["completed"]).inc();
                info!("ingested {}: {}", path.display(), output.summary);
            }
            Err(e) => {
                self.set_state(IngestState::Failed);
                INGEST_RUNS.with_label_values(&["failed"]).inc();
                error!("ingestion of {} failed: {e}", path.display());
            }
        }
        result
    }

    async fn execute(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<IngestOutput, PipelineError> {
        self.set_state(IngestState::Planning);
        let pool = Arc::new(StringPool::new());
        let (input, size) = validate_input(path)?;
        let plan = self.plan_size(size)?;
        info!(
            "planned {} chunks, {} concurrent, for {} ({})",
            plan.chunk_count,
            plan.max_concurrent,
            input.display(),
            human_bytes(size)
        );

        self.set_state(IngestState::Splitting);
        let splitter = Splitter::new(
            self.launcher.clone(),
            self.settings.tools.clone(),
            self.settings.temp_dir.clone(),
            self.settings.split_timeout,
        );
        let chunks = splitter.split(&input, plan.chunk_count, cancel).await?;
        let chunk_count = chunks.len();

        self.set_state(IngestState::Decoding);
        let runner = DecoderRunner::new(
            self.launcher.clone(),
            self.settings.tools.decoder.clone(),
            plan.max_concurrent,
            self.settings.chunk_timeout,
            pool.clone(),
        );
        let outputs = decode_all(&runner, &chunks, cancel).await?;

        check_malformed(&outputs, self.settings.max_malformed_ratio)?;
        let total_lines: u64 = outputs.iter().map(|o| o.lines).sum();
        let malformed_lines: u64 = outputs.iter().map(|o| o.malformed).sum();

        self.set_state(IngestState::Merging);
        let merger = Merger::new(outputs, self.settings.merge_policy, Some(cancel.clone()));
        let records = tokio::task::spawn_blocking(move || {
            let mut records = Vec::with_capacity(merger.total_records() as usize);
            for record in merger {
                records.push(record?);
            }
            Ok::<_, PipelineError>(records)
        })
        .await
        .map_err(|e| PipelineError::TaskFailed(e.to_string()))??;
        drop(chunks);

        let stats = pool.stats();
        INTERNED_STRINGS.set(stats.entries as f64);
        let summary = IngestSummary {
            file_size: size,
            total_records: records.len() as u64,
            total_lines,
            malformed_lines,
            chunk_count,
            max_concurrent: plan.max_concurrent.min(chunk_count),
            interned_strings: stats.entries,
            pool: stats,
            elapsed: started.elapsed(),
        };
        Ok(IngestOutput { records, summary })
    }
}

/// Checks that `path` is a readable, non-empty regular file; returns it canonicalized with its size.
fn validate_input(path: &Path) -> Result<(PathBuf, u64), PipelineError> {
    let metadata = fs::metadata(path).map_err(|e| {
        PipelineError::InvalidInput(format!("cannot stat {}: {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(PipelineError::InvalidInput(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "{} is empty",
            path.display()
        )));
    }
    fs::File::open(path).map_err(|e| {
        PipelineError::InvalidInput(format!("cannot read {}: {e}", path.display()))
    })?;
    Ok((sanitize_input_path(path)?, metadata.len()))
}

/// Decodes every chunk under the runner's gate. The first real failure cancels
/// the rest; every task is drained before returning.
async fn decode_all(
    runner: &DecoderRunner,
    chunks: &ChunkSet,
    cancel: &CancellationToken,
) -> Result<Vec<ChunkOutput>, PipelineError> {
    let run_cancel = cancel.child_token();
    let mut tasks = JoinSet::new();
    for chunk in chunks.chunks() {
        let runner = runner.clone();
        let chunk = chunk.clone();
        let token = run_cancel.clone();
        tasks.spawn(async move { runner.run(chunk, token).await });
    }

    let mut outputs = Vec::with_capacity(chunks.len());
    let mut first_error: Option<PipelineError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| PipelineError::TaskFailed(e.to_string()))
            .and_then(|r| r);
        match result {
            Ok(output) => {
                chunks.remove_chunk(&output.chunk);
                outputs.push(output);
            }
            Err(e) => match &first_error {
                None => {
                    run_cancel.cancel();
                    first_error = Some(e);
                }
                Some(PipelineError::Cancelled) if !matches!(e, PipelineError::Cancelled) => {
                    first_error = Some(e);
                }
                Some(_) => debug!("after abort: {e}"),
            },
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    outputs.sort_by_key(|o| o.chunk.index);
    Ok(outputs)
}

fn chunk_outcome(output: &ChunkOutput, max_malformed_ratio: f64) -> &'static str {
    if output.malformed_ratio() > max_malformed_ratio {
        "malformed"
    } else {
        "ok"
    }
}

/// Counts each decoded chunk once by outcome and fails on the first chunk over
/// the malformed-line threshold.
fn check_malformed(outputs: &[ChunkOutput], max_malformed_ratio: f64) -> Result<(), PipelineError> {
    let mut exceeded = None;
    for output in outputs {
        let outcome = chunk_outcome(output, max_malformed_ratio);
        CHUNKS.with_label_values(&[outcome]).inc();
        if outcome == "malformed" && exceeded.is_none() {
            warn!(
                "chunk {}: {} of {} lines malformed",
                output.chunk.index, output.malformed, output.lines
            );
            exceeded = Some(PipelineError::MalformedThresholdExceeded {
                chunk: output.chunk.index,
                malformed: output.malformed,
                lines: output.lines,
            });
        }
    }
    exceeded.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::splitter::ChunkDescriptor;

    fn output(index: usize, lines: u64, malformed: u64) -> ChunkOutput {
        ChunkOutput {
            chunk: ChunkDescriptor {
                index,
                path: PathBuf::from(format!("chunk_{index}")),
                capture_offset: 0,
            },
            records: Vec::new(),
            lines,
            malformed,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_each_chunk_has_one_outcome() {
        let outputs = vec![output(0, 10, 0), output(1, 10, 9), output(2, 10, 5), output(3, 0, 0)];
        let outcomes: Vec<&str> = outputs.iter().map(|o| chunk_outcome(o, 0.5)).collect();
        assert_eq!(outcomes, vec!["ok", "malformed", "ok", "ok"]);

        match check_malformed(&outputs, 0.5) {
            Err(PipelineError::MalformedThresholdExceeded {
                chunk,
                malformed,
                lines,
            }) => assert_eq!((chunk, malformed, lines), (1, 9, 10)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_malformed(&outputs, 1.0).is_ok());
    }
}
