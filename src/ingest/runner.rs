// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Runs the decoder over one chunk and parses its output as it streams.
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ToolTemplate;
use crate::constants::LINE_BUFFER_CAPACITY;
use crate::ingest::parser::FieldParser;
use crate::ingest::pool::StringPool;
use crate::ingest::record::PacketRecord;
use crate::ingest::splitter::ChunkDescriptor;
use crate::ingest::tool::{TemplateVars, ToolCommand, ToolExit, ToolLauncher};
use crate::ingest::PipelineError;
use crate::metrics::{CHUNKS, CHUNK_DECODE_DURATION, MALFORMED_LINES, RECORDS_PARSED};

/// A successfully decoded chunk. Records are in decoder order and numbered `1..=n`.
#[derive(Debug)]
pub struct ChunkOutput {
    pub chunk: ChunkDescriptor,
    pub records: Vec<PacketRecord>,
    /// Lines read from the decoder, malformed ones included.
    pub lines: u64,
    pub malformed: u64,
    pub elapsed: Duration,
}

impl ChunkOutput {
    pub fn malformed_ratio(&self) -> f64 {
        if self.lines == 0 {
            0.0
        } else {
            self.malformed as f64 / self.lines as f64
        }
    }
}

pub type ChunkResult = Result<ChunkOutput, PipelineError>;

/// Decodes chunks, at most `max_concurrent` processes at a time across all clones.
#[derive(Clone)]
pub struct DecoderRunner {
    launcher: Arc<dyn ToolLauncher>,
    template: ToolTemplate,
    gate: Arc<Semaphore>,
    timeout: Duration,
    pool: Arc<StringPool>,
}

struct Decoded {
    records: Vec<PacketRecord>,
    lines: u64,
    malformed: u64,
    exit: ToolExit,
}

enum Outcome {
    Done(std::io::Result<Decoded>),
    TimedOut,
    Cancelled,
}

impl DecoderRunner {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        template: ToolTemplate,
        max_concurrent: usize,
        timeout: Duration,
        pool: Arc<StringPool>,
    ) -> Self {
        Self {
            launcher,
            template,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            pool,
        }
    }

    pub async fn run(&self, chunk: ChunkDescriptor, cancel: CancellationToken) -> ChunkResult {
        let result = self.decode(chunk, &cancel).await;
        match &result {
            // Decoded chunks are counted once the malformed threshold is applied.
            Ok(output) => {
                RECORDS_PARSED.inc_by(output.records.len() as f64);
                MALFORMED_LINES.inc_by(output.malformed as f64);
                CHUNK_DECODE_DURATION.observe(output.elapsed.as_secs_f64());
            }
            Err(e) => CHUNKS.with_label_values(&[e.outcome()]).inc(),
        }
        result
    }

    async fn decode(&self, chunk: ChunkDescriptor, cancel: &CancellationToken) -> ChunkResult {
        let index = chunk.index;

        // Held until this function returns, whatever the path.
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            permit = self.gate.clone().acquire_owned() => {
                permit.map_err(|_| PipelineError::Cancelled)?
            }
        };

        let started = Instant::now();
        let command = ToolCommand::render(
            &self.template,
            &TemplateVars {
                input: Some(&chunk.path),
                ..Default::default()
            },
        );
        let mut process =
            self.launcher
                .launch(&command)
                .map_err(|e| PipelineError::DecoderProcessFailed {
                    chunk: index,
                    exit_code: None,
                    stderr: format!("cannot run {}: {e}", command.program),
                })?;
        debug!("chunk {index}: decoding {}", chunk.path.display());

        let Some(stdout) = process.take_stdout() else {
            let _ = process.kill().await;
            return Err(PipelineError::DecoderProcessFailed {
                chunk: index,
                exit_code: None,
                stderr: "decoder stdout unavailable".to_string(),
            });
        };
        let parser = FieldParser::new(&*self.pool, chunk.capture_offset);

        let outcome = {
            let work = async {
                let mut reader = BufReader::new(stdout);
                let mut line = Vec::with_capacity(LINE_BUFFER_CAPACITY);
                let mut records = Vec::new();
                let mut lines = 0u64;
                let mut malformed = 0u64;
                loop {
                    line.clear();
                    if reader.read_until(b'\n', &mut line).await? == 0 {
                        break;
                    }
                    lines += 1;
                    match parser.parse_bytes(&line) {
                        Ok(mut record) => {
                            record.frame_number = records.len() as u64 + 1;
                            records.push(record);
                        }
                        Err(reason) => {
                            malformed += 1;
                            trace!("chunk {index}: skipping line {lines}: {reason}");
                        }
                    }
                }
                let exit = process.wait().await?;
                Ok::<_, std::io::Error>(Decoded {
                    records,
                    lines,
                    malformed,
                    exit,
                })
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                res = timeout(self.timeout, work) => match res {
                    Ok(done) => Outcome::Done(done),
                    Err(_) => Outcome::TimedOut,
                },
            }
        };

        match outcome {
            Outcome::Cancelled => {
                let _ = process.kill().await;
                debug!("chunk {index}: cancelled");
                Err(PipelineError::Cancelled)
            }
            Outcome::TimedOut => {
                if let Err(e) = process.kill().await {
                    warn!("chunk {index}: failed to kill decoder: {e}");
                }
                warn!("chunk {index}: decoder timed out after {:?}", self.timeout);
                Err(PipelineError::DecoderTimedOut {
                    chunk: index,
                    timeout: self.timeout,
                })
            }
            Outcome::Done(Err(e)) => {
                let _ = process.kill().await;
                Err(PipelineError::DecoderProcessFailed {
                    chunk: index,
                    exit_code: None,
                    stderr: e.to_string(),
                })
            }
            Outcome::Done(Ok(decoded)) if !decoded.exit.success() => {
                warn!(
                    "chunk {index}: decoder exited with {:?} after {} lines",
                    decoded.exit.code, decoded.lines
                );
                Err(PipelineError::DecoderProcessFailed {
                    chunk: index,
                    exit_code: decoded.exit.code,
                    stderr: decoded.exit.stderr,
                })
            }
            Outcome::Done(Ok(decoded)) => {
                let elapsed = started.elapsed();
                debug!(
                    "chunk {index}: {} records, {} malformed lines in {elapsed:?}",
                    decoded.records.len(),
                    decoded.malformed
                );
                Ok(ChunkOutput {
                    chunk,
                    records: decoded.records,
                    lines: decoded.lines,
                    malformed: decoded.malformed,
                    elapsed,
                })
            }
        }
    }
}
