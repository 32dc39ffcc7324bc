// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Size-tiered chunk planning. Pure and deterministic: no I/O, the core count is injected.
use serde::Serialize;

use crate::config::PlannerConfig;
use crate::ingest::PipelineError;
use crate::util::available_cores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    pub chunk_count: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    config: PlannerConfig,
    cores: usize,
}

impl ChunkPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self::with_cores(config, available_cores())
    }

    pub fn with_cores(config: PlannerConfig, cores: usize) -> Self {
        Self {
            config,
            cores: cores.max(1),
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn plan(&self, file_size: u64) -> Result<ChunkPlan, PipelineError> {
        if file_size == 0 {
            return Err(PipelineError::InvalidInput(
                "capture file is empty".to_string(),
            ));
        }
        let c = &self.config;
        let chunk_count = if file_size < c.single_chunk_below {
            1
        } else if file_size < c.two_chunks_below {
            2
        } else if file_size < c.four_chunks_below {
            4
        } else {
            self.cores.min(c.max_chunks)
        };
        Ok(self.bounded(chunk_count))
    }

    /// Uses `chunk_count` as given, keeping the concurrency cap.
    pub fn forced(&self, chunk_count: usize, file_size: u64) -> Result<ChunkPlan, PipelineError> {
        if file_size == 0 {
            return Err(PipelineError::InvalidInput(
                "capture file is empty".to_string(),
            ));
        }
        if chunk_count == 0 {
            return Err(PipelineError::InvalidInput(
                "chunk count must be at least 1".to_string(),
            ));
        }
        Ok(self.bounded(chunk_count))
    }

    fn bounded(&self, chunk_count: usize) -> ChunkPlan {
        let chunk_count = chunk_count.max(1);
        ChunkPlan {
            chunk_count,
            max_concurrent: chunk_count.min(self.cores),
        }
    }
}
