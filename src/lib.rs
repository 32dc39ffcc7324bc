// SPDX-License-Identifier: BSD-3-Clause-LBNL
pub mod config;
pub mod constants;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod util;

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::Result;
use crate::ingest::{IngestOrchestrator, IngestOutput, ProcessLauncher};

/// Ingests `path` with the configured external tools.
pub async fn ingest_file(
    config: &Config,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<IngestOutput> {
    metrics::init_metrics();
    let orchestrator = IngestOrchestrator::from_config(config, Arc::new(ProcessLauncher))?;
    Ok(orchestrator.run(path, cancel).await?)
}
