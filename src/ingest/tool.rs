// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! External tools as an injected capability.
//!
//! The pipeline never talks to `tokio::process` directly: it renders a
//! [`ToolCommand`] from a configured template and hands it to a
//! [`ToolLauncher`]. [`ProcessLauncher`] runs real programs; the simulated
//! launcher in [`crate::ingest::mock`] replays scripted output.
use futures::future::BoxFuture;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ToolTemplate;
use crate::constants::{
    DECODER_FIELDS, PLACEHOLDER_FIELDS, PLACEHOLDER_INPUT, PLACEHOLDER_OUTPUT,
    PLACEHOLDER_RECORDS, STDERR_TAIL_BYTES,
};
use crate::util::tail_utf8_lossy;

pub type ToolStdout = Pin<Box<dyn AsyncRead + Send>>;

/// A fully rendered invocation: program plus argv, no shell involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    /// Renders `template`, replacing arguments that are exactly a placeholder.
    /// `{fields}` expands to one `-e <field>` pair per decoder field.
    pub fn render(template: &ToolTemplate, vars: &TemplateVars<'_>) -> Self {
        let mut args = Vec::with_capacity(template.args.len());
        for arg in &template.args {
            let rendered = match arg.as_str() {
                PLACEHOLDER_FIELDS => {
                    for field in DECODER_FIELDS {
                        args.push(OsString::from("-e"));
                        args.push(OsString::from(field));
                    }
                    continue;
                }
                PLACEHOLDER_INPUT => vars.input.map(|p| p.as_os_str().to_owned()),
                PLACEHOLDER_OUTPUT => vars.output.map(|p| p.as_os_str().to_owned()),
                PLACEHOLDER_RECORDS => vars.records.map(|n| OsString::from(n.to_string())),
                _ => None,
            };
            args.push(rendered.unwrap_or_else(|| OsString::from(arg)));
        }
        Self {
            program: template.program.clone(),
            args,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&OsStr> {
        self.args.get(index).map(|a| a.as_os_str())
    }
}

impl std::fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Values substituted into a [`ToolTemplate`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub input: Option<&'a Path>,
    pub output: Option<&'a Path>,
    pub records: Option<u64>,
}

/// How a tool process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Tail of the process' stderr.
    pub stderr: String,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Spawns tool processes.
pub trait ToolLauncher: Send + Sync {
    fn launch(&self, command: &ToolCommand) -> io::Result<Box<dyn ToolProcess>>;
}

/// A running tool process. Dropping it must terminate the process.
pub trait ToolProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Takes the stdout stream; `None` after the first call.
    fn take_stdout(&mut self) -> Option<ToolStdout>;

    /// Waits for the process to exit. Cancel-safe.
    fn wait(&mut self) -> BoxFuture<'_, io::Result<ToolExit>>;

    /// Kills the process and everything it spawned, then reaps it.
    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Launches real OS processes with `tokio::process`.
///
/// Children get their own process group on Unix so [`ToolProcess::kill`] can
/// take down helpers they fork, and are killed if their handle is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ToolLauncher for ProcessLauncher {
    fn launch(&self, command: &ToolCommand) -> io::Result<Box<dyn ToolProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        debug!("spawned {} (pid {:?})", command.program, child.id());

        // stderr is drained concurrently so a chatty tool never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_stderr_tail(s)));
        Ok(Box::new(OsProcess { child, stderr_task }))
    }
}

struct OsProcess {
    child: Child,
    stderr_task: Option<JoinHandle<String>>,
}

impl ToolProcess for OsProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ToolStdout> {
        self.child
            .stdout
            .take()
            .map(|s| Box::pin(s) as ToolStdout)
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ToolExit>> {
        Box::pin(async move {
            let status = self.child.wait().await?;
            let stderr = match self.stderr_task.as_mut() {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            self.stderr_task = None;
            Ok(ToolExit {
                code: status.code(),
                stderr,
            })
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            #[cfg(unix)]
            if let Some(pid) = self.child.id() {
                // The child leads its own group; signal the whole group.
                match Command::new("kill")
                    .arg("-KILL")
                    .arg("--")
                    .arg(format!("-{pid}"))
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                {
                    Ok(status) if !status.success() => {
                        debug!("kill of process group {pid} exited with {status}")
                    }
                    Err(e) => warn!("could not signal process group {pid}: {e}"),
                    _ => {}
                }
            }
            match self.child.kill().await {
                Ok(()) => Ok(()),
                // Already exited and reaped.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(e),
            }
        })
    }
}

async fn read_stderr_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > 2 * STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    tail_utf8_lossy(&tail, STDERR_TAIL_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FIELD_COUNT;
    use std::path::PathBuf;

    fn template(program: &str, args: &[&str]) -> ToolTemplate {
        ToolTemplate {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_render_substitutes_whole_arguments_only() {
        let t = template("editcap", &["-c", "{records}", "{input}", "{output}", "x{input}"]);
        let input = PathBuf::from("/data/a b;rm -rf $(x).pcap");
        let output = PathBuf::from("/tmp/work/chunk.pcap");
        let cmd = ToolCommand::render(
            &t,
            &TemplateVars {
                input: Some(&input),
                output: Some(&output),
                records: Some(250),
            },
        );
        assert_eq!(cmd.program, "editcap");
        assert_eq!(cmd.arg(1), Some(OsStr::new("250")));
        // The path stays one argv element, metacharacters and all.
        assert_eq!(cmd.arg(2), Some(input.as_os_str()));
        assert_eq!(cmd.arg(3), Some(output.as_os_str()));
        assert_eq!(cmd.arg(4), Some(OsStr::new("x{input}")));
    }

    #[test]
    fn test_render_expands_fields() {
        let t = template("tshark", &["-r", "{input}", "{fields}", "-q"]);
        let input = PathBuf::from("/tmp/c.pcap");
        let cmd = ToolCommand::render(
            &t,
            &TemplateVars {
                input: Some(&input),
                ..Default::default()
            },
        );
        assert_eq!(cmd.args.len(), 3 + 2 * FIELD_COUNT);
        assert_eq!(cmd.arg(2), Some(OsStr::new("-e")));
        assert_eq!(cmd.arg(3), Some(OsStr::new("frame.number")));
        assert_eq!(cmd.args.last().map(|a| a.as_os_str()), Some(OsStr::new("-q")));
    }

    #[test]
    fn test_render_leaves_unset_placeholders() {
        let t = template("capinfos", &["{output}"]);
        let cmd = ToolCommand::render(&t, &TemplateVars::default());
        assert_eq!(cmd.arg(0), Some(OsStr::new("{output}")));
        assert_eq!(cmd.to_string(), "capinfos {output}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_streams_and_exits() {
        let cmd = ToolCommand {
            program: "sh".to_string(),
            args: vec!["-c".into(), "echo one; echo two; echo oops >&2; exit 3".into()],
        };
        let mut process = ProcessLauncher.launch(&cmd).unwrap();
        let mut stdout = process.take_stdout().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(out, "one\ntwo\n");
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stderr, "oops");
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_launcher_kill() {
        let cmd = ToolCommand {
            program: "sleep".to_string(),
            args: vec!["30".into()],
        };
        let mut process = ProcessLauncher.launch(&cmd).unwrap();
        assert!(process.id().is_some());
        process.kill().await.unwrap();
        assert!(process.id().is_none());
    }

    #[tokio::test]
    async fn test_process_launcher_missing_binary() {
        let cmd = ToolCommand {
            program: "/nonexistent/capingest-decoder".to_string(),
            args: vec![],
        };
        assert!(ProcessLauncher.launch(&cmd).is_err());
    }
}
