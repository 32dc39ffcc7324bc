// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Materializes a capture as independently decodable chunk files.
//!
//! Splitting is packet-aligned: the records in the capture are counted with the
//! configured counter tool and the splitter tool writes fragments of
//! `ceil(total / chunk_count)` records each into a scoped temporary directory.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ToolsConfig;
use crate::ingest::tool::{TemplateVars, ToolCommand, ToolLauncher};
use crate::ingest::PipelineError;

/// One fragment of the capture. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub path: PathBuf,
    /// Capture frames in all preceding chunks.
    pub capture_offset: u64,
}

/// The chunks of one run. Dropping the set removes its temporary directory.
#[derive(Debug)]
pub struct ChunkSet {
    chunks: Vec<ChunkDescriptor>,
    workdir: Option<TempDir>,
}

impl ChunkSet {
    /// The whole capture as chunk 0, nothing to clean up.
    pub fn single(path: PathBuf) -> Self {
        Self {
            chunks: vec![ChunkDescriptor {
                index: 0,
                path,
                capture_offset: 0,
            }],
            workdir: None,
        }
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(|d| d.path())
    }

    /// Deletes a decoded fragment early. The original capture is never touched.
    pub fn remove_chunk(&self, chunk: &ChunkDescriptor) {
        let Some(workdir) = self.workdir() else {
            return;
        };
        if !chunk.path.starts_with(workdir) {
            return;
        }
        if let Err(e) = fs::remove_file(&chunk.path) {
            debug!("could not remove {}: {e}", chunk.path.display());
        }
    }
}

/// Canonicalizes a capture path and rejects names no tool should be handed.
pub fn sanitize_input_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let canonical = path.canonicalize().map_err(|e| {
        PipelineError::InvalidInput(format!("cannot resolve {}: {e}", path.display()))
    })?;
    if canonical.to_string_lossy().chars().any(char::is_control) {
        return Err(PipelineError::InvalidInput(format!(
            "path contains control characters: {:?}",
            canonical
        )));
    }
    Ok(canonical)
}

pub struct Splitter {
    launcher: Arc<dyn ToolLauncher>,
    tools: ToolsConfig,
    temp_dir: Option<PathBuf>,
    timeout: Duration,
}

impl Splitter {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        tools: ToolsConfig,
        temp_dir: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            tools,
            temp_dir,
            timeout,
        }
    }

    pub async fn split(
        &self,
        input: &Path,
        chunk_count: usize,
        cancel: &CancellationToken,
    ) -> Result<ChunkSet, PipelineError> {
        let input = sanitize_input_path(input)?;
        if chunk_count <= 1 {
            return Ok(ChunkSet::single(input));
        }

        let total = self.count_records(&input, cancel).await?;
        if total == 0 {
            warn!("{} contains no records, decoding as one chunk", input.display());
            return Ok(ChunkSet::single(input));
        }
        let records_per_chunk = total.div_ceil(chunk_count as u64);

        let mut builder = tempfile::Builder::new();
        builder.prefix("capingest-");
        let workdir = match &self.temp_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(|e| PipelineError::SplitFailed(format!("cannot create work directory: {e}")))?;

        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("pcap");
        let output = workdir.path().join(format!("chunk.{extension}"));
        let command = ToolCommand::render(
            &self.tools.splitter,
            &TemplateVars {
                input: Some(&input),
                output: Some(&output),
                records: Some(records_per_chunk),
            },
        );
        self.run_tool("splitter", command, cancel).await?;

        let mut paths: Vec<PathBuf> = fs::read_dir(workdir.path())
            .map_err(|e| PipelineError::SplitFailed(format!("cannot list chunks: {e}")))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(PipelineError::SplitFailed(format!(
                "{} produced no chunk files",
                self.tools.splitter.program
            )));
        }

        let chunks: Vec<ChunkDescriptor> = paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| ChunkDescriptor {
                index,
                path,
                capture_offset: index as u64 * records_per_chunk,
            })
            .collect();
        info!(
            "split {total} records into {} chunks of up to {records_per_chunk}",
            chunks.len()
        );

        Ok(ChunkSet {
            chunks,
            workdir: Some(workdir),
        })
    }

    /// Runs the counter tool; the record count is the last integer it prints.
    pub async fn count_records(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let command = ToolCommand::render(
            &self.tools.counter,
            &TemplateVars {
                input: Some(input),
                ..Default::default()
            },
        );
        let stdout = self.run_tool("counter", command, cancel).await?;
        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| line.split_whitespace().last())
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                PipelineError::SplitFailed(format!(
                    "cannot read a record count from {} output {:?}",
                    self.tools.counter.program,
                    stdout.trim()
                ))
            })
    }

    async fn run_tool(
        &self,
        stage: &str,
        command: ToolCommand,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        debug!("running {stage}: {command}");
        let mut process = self.launcher.launch(&command).map_err(|e| {
            PipelineError::SplitFailed(format!("cannot run {stage} {}: {e}", command.program))
        })?;
        let mut stdout = process.take_stdout();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = timeout(self.timeout, async {
                let mut out = Vec::new();
                if let Some(stdout) = stdout.as_mut() {
                    stdout.read_to_end(&mut out).await?;
                }
                let exit = process.wait().await?;
                Ok::<_, std::io::Error>((out, exit))
            }) => Some(res),
        };

        match outcome {
            None => {
                let _ = process.kill().await;
                Err(PipelineError::Cancelled)
            }
            Some(Err(_)) => {
                let _ = process.kill().await;
                Err(PipelineError::SplitFailed(format!(
                    "{stage} {} timed out after {:?}",
                    command.program, self.timeout
                )))
            }
            Some(Ok(Err(e))) => {
                let _ = process.kill().await;
                Err(PipelineError::SplitFailed(format!(
                    "{stage} {}: {e}",
                    command.program
                )))
            }
            Some(Ok(Ok((_, exit)))) if !exit.success() => Err(PipelineError::SplitFailed(format!(
                "{stage} {} exited with {:?}: {}",
                command.program, exit.code, exit.stderr
            ))),
            Some(Ok(Ok((out, _)))) => Ok(String::from_utf8_lossy(&out).into_owned()),
        }
    }
}
