//! Process-backed grading engine
//!
//! Materializes the submission into a scratch directory and runs the
//! configured grading program on it:
//!
//! `<command...> <format> <repo> <problem> <ccid> <submission_dir>`
//!
//! Whatever the program prints on stdout is the rendered report.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{GradingEngine, GradingRequest};
use crate::submission::Submission;

/// Engine that runs an external grading program per request
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    /// Create from a command vector (first element is program, rest are args)
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Grading engine command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl GradingEngine for CommandEngine {
    async fn run(&self, request: &GradingRequest) -> Result<String> {
        let temp_dir = tempfile::tempdir().context("Failed to create submission directory")?;
        write_submission(temp_dir.path(), &request.submission).await?;

        debug!(
            "Running grading engine: {} {:?} format={} repo={} problem={} files={}",
            self.program,
            self.args,
            request.format.selector(),
            request.repo,
            request.problem,
            request.submission.len()
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(request.format.selector())
            .arg(&request.repo)
            .arg(&request.problem)
            .arg(&request.ccid)
            .arg(temp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn grading engine {}", self.program))?;

        // Compilers and test runs are spawned by the engine; if this future is
        // dropped on deadline the whole group goes with it.
        let mut group = ProcessGroup(child.id());

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for grading engine")?;
        group.0 = None;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Grading engine exited with {}: {}",
                output.status,
                stderr.chars().take(500).collect::<String>()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Kills the engine's process group when dropped while still armed
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("Failed to kill grading engine group {}: {}", pid, e);
            }
        }
    }
}

async fn write_submission(dir: &Path, submission: &Submission) -> Result<()> {
    for (path, content) in submission.iter() {
        let dest = dir.join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory for {}", path))?;
        }
        fs::write(&dest, content)
            .await
            .with_context(|| format!("Failed to write submission file {}", path))?;
    }
    Ok(())
}
