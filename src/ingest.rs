// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Parallel capture ingestion: plan chunks, split the capture, decode each chunk
//! with an external decoder under a concurrency bound, parse its output and
//! merge everything back into one time-ordered record sequence.
//!
//! ```text
//! file -> planner -> splitter -> [runner x N -> parser] -> merger -> records
//! ```
use std::time::Duration;
use thiserror::Error;

pub mod cli;
pub mod merger;
pub mod mock;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod pool;
pub mod record;
pub mod runner;
pub mod splitter;
pub mod tool;


pub use merger::{MergePolicy, Merger};
pub use orchestrator::{IngestOrchestrator, IngestOutput, IngestSettings, IngestState, IngestSummary};
pub use parser::{FieldParser, Malformed};
pub use planner::{ChunkPlan, ChunkPlanner};
pub use pool::StringPool;
pub use record::{PacketRecord, RawFields, TcpFlags};
pub use runner::{ChunkOutput, ChunkResult, DecoderRunner};
pub use splitter::{ChunkDescriptor, ChunkSet, Splitter};
pub use tool::{ProcessLauncher, ToolCommand, ToolLauncher, ToolProcess};

/// Everything that can abort an ingestion run. Malformed decoder lines are not
/// errors; they are counted per chunk.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("splitting failed: {0}")]
    SplitFailed(String),

    #[error(
        "decoder for chunk {chunk} failed (exit code {}): {stderr}",
        .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
    )]
    DecoderProcessFailed {
        chunk: usize,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("decoder for chunk {chunk} timed out after {timeout:?}")]
    DecoderTimedOut { chunk: usize, timeout: Duration },

    #[error("merge invariant violated in chunk {chunk} (previous frame {previous_frame}, frame {frame}): {reason}")]
    MergeInvariantViolated {
        chunk: usize,
        previous_frame: u64,
        frame: u64,
        reason: String,
    },

    #[error("chunk {chunk}: {malformed} of {lines} decoder lines were malformed")]
    MalformedThresholdExceeded {
        chunk: usize,
        malformed: u64,
        lines: u64,
    },

    #[error("ingestion cancelled")]
    Cancelled,

    #[error("ingestion task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Metrics label for the chunk outcome this error represents.
    pub fn outcome(&self) -> &'static str {
        match self {
            PipelineError::DecoderTimedOut { .. } => "timed_out",
            PipelineError::Cancelled => "cancelled",
            PipelineError::MalformedThresholdExceeded { .. } => "malformed",
            _ => "failed",
        }
    }
}
