// SPDX-License-Identifier: BSD-3-Clause-LBNL
// src/ingest/cli.rs
use clap::Args;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{parse_duration, Config};
use crate::errors::{Error, Result};
use crate::ingest::mock::{text_capture_handler, write_synthetic_capture, MockLauncher};
use crate::ingest::orchestrator::{IngestOrchestrator, IngestSettings};
use crate::ingest::record::PacketRecord;
use crate::ingest::tool::{ProcessLauncher, ToolLauncher};
use crate::util::human_bytes;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Capture file to ingest.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Split into exactly this many chunks instead of sizing by file size.
    #[arg(short, long)]
    pub chunks: Option<usize>,

    /// Per-chunk decoder timeout, e.g. `90s` or `10m`.
    #[arg(short, long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Write records as JSON lines to this file, or `-` for stdout.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub summary_json: bool,

    /// Use the built-in simulated tools; FILE is a text capture as written by `synth`.
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Capture file to plan for.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Plan as if the machine had this many cores.
    #[arg(long)]
    pub cores: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SynthArgs {
    /// Where to write the text capture.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Number of packets.
    #[arg(short, long, default_value = "10000")]
    pub records: usize,

    /// Damage every Nth line (0 keeps all lines intact).
    #[arg(short, long, default_value = "0")]
    pub malformed_every: usize,
}

impl IngestArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let mut config = config.clone();
        if let Some(timeout) = &self.timeout {
            parse_duration(timeout)?;
            config.ingest.chunk_timeout = timeout.clone();
        }
        if let Some(chunks) = self.chunks {
            if chunks == 0 {
                return Err(Error::Usage("--chunks must be at least 1".to_string()));
            }
            config.ingest.force_chunks = Some(chunks);
        }

        let launcher: Arc<dyn ToolLauncher> = if self.simulate {
            info!("using simulated tools");
            Arc::new(MockLauncher::new(text_capture_handler(&config.ingest.tools)))
        } else {
            Arc::new(ProcessLauncher)
        };
        let orchestrator = IngestOrchestrator::from_config(&config, launcher)?;

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling ingestion");
                    cancel.cancel();
                }
            }
        });
        let result = orchestrator.run(&self.file, &cancel).await;
        interrupt.abort();
        let output = result?;

        let to_stdout = self.output.as_deref() == Some(Path::new("-"));
        if let Some(path) = &self.output {
            if to_stdout {
                write_records(io::stdout().lock(), &output.records)?;
            } else {
                write_records(File::create(path)?, &output.records)?;
                info!("wrote {} records to {}", output.records.len(), path.display());
            }
        }

        let summary = if self.summary_json {
            serde_json::to_string_pretty(&output.summary)?
        } else {
            output.summary.to_string()
        };
        if to_stdout {
            eprintln!("{summary}");
        } else {
            println!("{summary}");
        }
        Ok(())
    }
}

impl PlanArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let mut settings = IngestSettings::from_config(config)?;
        settings.cores = self.cores;
        let orchestrator = IngestOrchestrator::new(settings, Arc::new(ProcessLauncher));
        let plan = orchestrator.plan(&self.file)?;
        let size = std::fs::metadata(&self.file)?.len();
        println!(
            "{}: {} -> {} chunks, {} decoders at a time",
            self.file.display(),
            human_bytes(size),
            plan.chunk_count,
            plan.max_concurrent
        );
        Ok(())
    }
}

impl SynthArgs {
    pub async fn run(&self, _config: &Config) -> Result<()> {
        let written = write_synthetic_capture(&self.file, self.records, self.malformed_every)?;
        println!("wrote {written} packets to {}", self.file.display());
        Ok(())
    }
}

/// Writes one JSON object per line.
pub fn write_records<W: Write>(writer: W, records: &[PacketRecord]) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::parser::FieldParser;
    use crate::ingest::pool::StringPool;
    use crate::ingest::mock::synthetic_line;

    #[test]
    fn test_write_records() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 0);
        let records: Vec<PacketRecord> = (0..3)
            .map(|i| parser.parse_line(&format!("{}\t{}", i + 1, synthetic_line(i))).unwrap())
            .collect();

        let mut out = Vec::new();
        write_records(&mut out, &records).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["frame_number"], 1);
        assert_eq!(lines[0]["transport"], "TCP");
        assert_eq!(lines[2]["protocol"], "HTTP");
        assert!(lines[0].get("raw").is_none());
    }

    #[tokio::test]
    async fn test_simulated_ingest_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        let output = dir.path().join("records.jsonl");
        SynthArgs {
            file: capture.clone(),
            records: 500,
            malformed_every: 0,
        }
        .run(&Config::embedded_default().unwrap())
        .await
        .unwrap();

        let mut config = Config::embedded_default().unwrap();
        config.ingest.temp_dir = Some(dir.path().to_path_buf());
        IngestArgs {
            file: capture,
            chunks: Some(3),
            timeout: Some("30s".to_string()),
            output: Some(output.clone()),
            summary_json: true,
            simulate: true,
        }
        .run(&config)
        .await
        .unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written.lines().count(), 500);
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let config = Config::embedded_default().unwrap();
        let args = IngestArgs {
            file: PathBuf::from("/nonexistent"),
            chunks: Some(0),
            timeout: None,
            output: None,
            summary_json: false,
            simulate: true,
        };
        assert!(matches!(args.run(&config).await, Err(Error::Usage(_))));

        let args = IngestArgs {
            chunks: None,
            timeout: Some("soon".to_string()),
            ..args
        };
        assert!(matches!(args.run(&config).await, Err(Error::ConfigFileError(_))));
    }
}
