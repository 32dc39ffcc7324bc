// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Simulated external tools.
//!
//! [`MockLauncher`] stands in for [`ProcessLauncher`](super::tool::ProcessLauncher):
//! a handler maps each rendered command to a [`MockScript`] (stdout lines, exit
//! code, delays, or hanging until killed). [`text_capture_handler`] goes one
//! step further and simulates the whole counter/splitter/decoder toolchain over
//! a plain-text "capture" whose lines are decoder columns without the frame
//! number, which is what the `simulate` command and the pipeline tests run on.
use futures::future::BoxFuture;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use crate::config::{ToolTemplate, ToolsConfig};
use crate::constants::{
    FIELD_COUNT, PLACEHOLDER_FIELDS, PLACEHOLDER_INPUT, PLACEHOLDER_OUTPUT, PLACEHOLDER_RECORDS,
};
use crate::ingest::tool::{ToolCommand, ToolExit, ToolLauncher, ToolProcess, ToolStdout};

/// What a simulated process does once launched.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub stdout: Vec<String>,
    pub exit_code: i32,
    pub stderr: String,
    /// Pause before each stdout line.
    pub line_delay: Option<Duration>,
    /// Keep stdout open and never exit until killed.
    pub hang: bool,
}

impl MockScript {
    pub fn lines<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        Self {
            stdout: lines.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = Some(delay);
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

pub type MockHandler = dyn Fn(&ToolCommand) -> io::Result<MockScript> + Send + Sync;

/// A [`ToolLauncher`] that runs scripted in-memory processes and keeps count of them.
pub struct MockLauncher {
    handler: Box<MockHandler>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    history: Mutex<Vec<ToolCommand>>,
}

impl MockLauncher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ToolCommand) -> io::Result<MockScript> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Processes launched and not yet exited, killed or dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live processes seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every command launched so far, in launch order.
    pub fn commands(&self) -> Vec<ToolCommand> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn launched(&self, program: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

impl ToolLauncher for MockLauncher {
    fn launch(&self, command: &ToolCommand) -> io::Result<Box<dyn ToolProcess>> {
        let script = (self.handler)(command)?;
        if let Ok(mut history) = self.history.lock() {
            history.push(command.clone());
        }

        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));

        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let MockScript {
            stdout,
            exit_code,
            stderr,
            line_delay,
            hang,
        } = script;
        let writer = tokio::spawn(async move {
            for line in stdout {
                if let Some(delay) = line_delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.write_all(line.as_bytes()).await.is_err()
                    || tx.write_all(b"\n").await.is_err()
                {
                    return;
                }
            }
            if hang {
                std::future::pending::<()>().await;
            }
        });

        Ok(Box::new(MockProcess {
            stdout: Some(rx),
            writer: Some(writer),
            exit_code,
            stderr,
            live: Some(guard),
        }))
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockProcess {
    stdout: Option<DuplexStream>,
    writer: Option<JoinHandle<()>>,
    exit_code: i32,
    stderr: String,
    live: Option<LiveGuard>,
}

impl ToolProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        self.live.as_ref().map(|_| 0)
    }

    fn take_stdout(&mut self) -> Option<ToolStdout> {
        self.stdout.take().map(|s| Box::pin(s) as ToolStdout)
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ToolExit>> {
        Box::pin(async move {
            // Nobody reads an untaken stdout; close it so the writer cannot block.
            self.stdout = None;
            if let Some(writer) = self.writer.as_mut() {
                let _ = writer.await;
            }
            self.writer = None;
            self.live = None;
            Ok(ToolExit {
                code: Some(self.exit_code),
                stderr: self.stderr.clone(),
            })
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if let Some(writer) = self.writer.take() {
                writer.abort();
            }
            self.stdout = None;
            self.live = None;
            Ok(())
        })
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Finds the rendered argument that `placeholder` produced in `command`.
pub fn placeholder_arg<'c>(
    template: &ToolTemplate,
    command: &'c ToolCommand,
    placeholder: &str,
) -> Option<&'c OsStr> {
    let mut position = 0;
    for arg in &template.args {
        if arg == placeholder {
            return command.arg(position);
        }
        position += if arg == PLACEHOLDER_FIELDS {
            2 * FIELD_COUNT
        } else {
            1
        };
    }
    None
}

/// Simulates the counter, splitter and decoder over a plain-text capture.
///
/// * counter: prints `<path>\t<line count>`
/// * splitter: writes `<stem>_<NNNNN><ext>` files of `{records}` lines next to `{output}`
/// * decoder: prints each line of its input prefixed by its 1-based frame number
pub fn text_capture_handler(
    tools: &ToolsConfig,
) -> impl Fn(&ToolCommand) -> io::Result<MockScript> + Send + Sync + 'static {
    let tools = tools.clone();
    move |command: &ToolCommand| {
        let path_arg = |template: &ToolTemplate, placeholder: &str| {
            placeholder_arg(template, command, placeholder)
                .map(PathBuf::from)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{command} has no {placeholder} argument"),
                    )
                })
        };

        if command.program == tools.counter.program {
            let input = path_arg(&tools.counter, PLACEHOLDER_INPUT)?;
            let count = match read_lines(&input) {
                Ok(lines) => lines.len(),
                Err(e) => {
                    return Ok(MockScript::default()
                        .exit_code(2)
                        .stderr(format!("cannot open {}: {e}", input.display())))
                }
            };
            Ok(MockScript::lines([format!("{}\t{count}", input.display())]))
        } else if command.program == tools.splitter.program {
            let input = path_arg(&tools.splitter, PLACEHOLDER_INPUT)?;
            let output = path_arg(&tools.splitter, PLACEHOLDER_OUTPUT)?;
            let records: usize = placeholder_arg(&tools.splitter, command, PLACEHOLDER_RECORDS)
                .and_then(|r| r.to_str())
                .and_then(|r| r.parse().ok())
                .filter(|&r| r > 0)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad record budget"))?;
            match split_text_capture(&input, &output, records) {
                Ok(_) => Ok(MockScript::default()),
                Err(e) => Ok(MockScript::default().exit_code(1).stderr(e.to_string())),
            }
        } else if command.program == tools.decoder.program {
            let input = path_arg(&tools.decoder, PLACEHOLDER_INPUT)?;
            match read_lines(&input) {
                Ok(lines) => Ok(MockScript::lines(
                    lines
                        .into_iter()
                        .enumerate()
                        .map(|(i, line)| format!("{}\t{line}", i + 1)),
                )),
                Err(e) => Ok(MockScript::default()
                    .exit_code(2)
                    .stderr(format!("cannot open {}: {e}", input.display()))),
            }
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", command.program),
            ))
        }
    }
}

fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    io::BufReader::new(fs::File::open(path)?).lines().collect()
}

/// Writes `records`-line fragments of `input` named after `output`, returning their paths.
pub fn split_text_capture(input: &Path, output: &Path, records: usize) -> io::Result<Vec<PathBuf>> {
    let lines = read_lines(input)?;
    let dir = output.parent().unwrap_or(Path::new("."));
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let mut paths = Vec::new();
    for (index, part) in lines.chunks(records.max(1)).enumerate() {
        let path = dir.join(format!("{stem}_{index:05}{ext}"));
        let mut file = BufWriter::new(fs::File::create(&path)?);
        for line in part {
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        paths.push(path);
    }
    Ok(paths)
}

const SYNTHETIC_PROTOCOLS: [(&str, &str); 6] = [
    ("tcp", "TCP"),
    ("tcp", "TLSv1.3"),
    ("tcp", "HTTP"),
    ("udp", "DNS"),
    ("udp", "QUIC"),
    ("icmp", "ICMP"),
];

/// One synthetic capture line (decoder columns after `frame.number`) for packet `i`.
/// Timestamps advance by one millisecond per packet.
pub fn synthetic_line(i: usize) -> String {
    let secs = 1_700_000_000 + (i / 1000) as u64;
    let millis = i % 1000;
    let (transport, protocol) = SYNTHETIC_PROTOCOLS[i % SYNTHETIC_PROTOCOLS.len()];
    let src = format!("10.0.{}.{}", i % 4, i % 50 + 1);
    let dst = format!("192.168.1.{}", i % 8 + 1);
    let src_port = (49152 + i % 1000).to_string();
    let len = (60 + i % 1400).to_string();
    let ts = format!("{secs}.{millis:03}000000");

    let mut columns: Vec<&str> = vec![""; FIELD_COUNT - 1];
    columns[0] = &ts;
    columns[1] = &len;
    columns[2] = &src;
    columns[3] = &dst;
    columns[12] = protocol;
    match transport {
        "tcp" => {
            columns[6] = "6";
            columns[8] = &src_port;
            columns[9] = if protocol == "HTTP" { "80" } else { "443" };
            columns[13] = "0x0018";
            if protocol == "HTTP" {
                columns[15] = "example.org";
            }
        }
        "udp" => {
            columns[6] = "17";
            columns[10] = &src_port;
            columns[11] = if protocol == "DNS" { "53" } else { "443" };
            if protocol == "DNS" {
                columns[14] = "example.org";
            }
        }
        _ => columns[6] = "1",
    }
    columns.join("\t")
}

/// Writes a synthetic capture of `records` lines. When `malformed_every` is
/// non-zero, every such line loses its last column. Returns the line count.
pub fn write_synthetic_capture(
    path: &Path,
    records: usize,
    malformed_every: usize,
) -> io::Result<usize> {
    let mut file = BufWriter::new(fs::File::create(path)?);
    for i in 0..records {
        let line = synthetic_line(i);
        if malformed_every != 0 && (i + 1) % malformed_every == 0 {
            let truncated = line.rsplit_once('\t').map(|(head, _)| head).unwrap_or("");
            writeln!(file, "{truncated}")?;
        } else {
            writeln!(file, "{line}")?;
        }
    }
    file.flush()?;
    Ok(records)
}
