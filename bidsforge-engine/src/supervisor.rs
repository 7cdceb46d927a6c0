//! Process supervisor for external conversion scripts
//!
//! Runs one script per unit of work in its own process group, captures its
//! output to `<name>.log` / `<name>.err` in the work directory and watches for
//! a cancel marker file. Cancellation terminates the whole group, not just the
//! shell, and renames the logs with a `.canceled` suffix.

use crate::error::{EngineError, EngineResult};
use bidsforge_common::config::SupervisorSettings;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub const CANCELED_SUFFIX: &str = "canceled";

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code zero and the completion callback succeeded
    Completed,
    /// Non-zero exit (or killed by a signal)
    Failed {
        exit_code: Option<i32>,
        last_error: Option<String>,
    },
    /// Cancel marker seen; process group terminated
    Canceled,
}

/// Log files of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RunLogs {
    fn for_script(work_dir: &Path, script: &Path) -> Self {
        let name = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());
        Self {
            stdout: work_dir.join(format!("{name}.log")),
            stderr: work_dir.join(format!("{name}.err")),
        }
    }

    fn mark_canceled(&self) -> EngineResult<()> {
        for path in [&self.stdout, &self.stderr] {
            if path.exists() {
                let mut renamed = path.clone().into_os_string();
                renamed.push(format!(".{CANCELED_SUFFIX}"));
                fs::rename(path, renamed)?;
            }
        }
        Ok(())
    }
}

/// Supervises external scripts
pub struct ScriptRunner {
    settings: SupervisorSettings,
}

impl ScriptRunner {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self { settings }
    }

    /// Path of the cancel marker inside a work directory
    pub fn cancel_marker(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.settings.cancel_marker)
    }

    /// Run `bash <script> <work_dir>` to completion or cancellation
    ///
    /// `on_complete` is called with the work directory only when the script
    /// exits with code zero; its error is returned as-is.
    pub async fn run<F>(&self, work_dir: &Path, script: &Path, on_complete: F) -> EngineResult<RunOutcome>
    where
        F: FnOnce(&Path) -> EngineResult<()>,
    {
        let logs = RunLogs::for_script(work_dir, script);
        let marker = self.cancel_marker(work_dir);

        let mut child = spawn(work_dir, script, &logs)?;
        info!(
            script = %script.display(),
            work_dir = %work_dir.display(),
            pid = ?child.id(),
            "Script started"
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms));
        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = ticker.tick() => {
                    if marker.exists() {
                        info!(marker = %marker.display(), "Cancel marker found, terminating script");
                        terminate_group(&mut child);
                        let status = child.wait().await?;
                        debug!(?status, "Canceled script exited");
                        break None;
                    }
                }
            }
        };

        let Some(status) = status else {
            logs.mark_canceled()?;
            return Ok(RunOutcome::Canceled);
        };

        if status.success() {
            info!(script = %script.display(), "Script completed");
            on_complete(work_dir)?;
            return Ok(RunOutcome::Completed);
        }

        let last_error = last_line(&logs.stderr);
        warn!(
            script = %script.display(),
            exit_code = ?status.code(),
            last_error = ?last_error,
            "Script failed"
        );
        Ok(RunOutcome::Failed {
            exit_code: status.code(),
            last_error,
        })
    }
}

fn spawn(work_dir: &Path, script: &Path, logs: &RunLogs) -> EngineResult<Child> {
    let stdout = File::create(&logs.stdout)?;
    let stderr = File::create(&logs.stderr)?;

    let mut cmd = std::process::Command::new("bash");
    cmd.arg(script)
        .arg(work_dir)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    Command::from(cmd)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::Script(format!("failed to start {}: {e}", script.display())))
}

/// Terminate the child's whole process group
#[cfg(unix)]
fn terminate_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own group, so its pid is the group id
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to signal process group, killing child"
        );
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate_group(child: &mut Child) {
    let _ = child.start_kill();
}

/// Last non-empty line of a log file
fn last_line(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()?
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_names_follow_script_stem() {
        let logs = RunLogs::for_script(Path::new("/work"), Path::new("/opt/convert.sh"));
        assert_eq!(logs.stdout, PathBuf::from("/work/convert.log"));
        assert_eq!(logs.stderr, PathBuf::from("/work/convert.err"));
    }

    #[test]
    fn test_last_line_skips_trailing_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.err");
        fs::write(&path, "first\nsecond problem\n\n  \n").unwrap();
        assert_eq!(last_line(&path), Some("second problem".to_string()));
        assert_eq!(last_line(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_mark_canceled_renames_existing_logs() {
        let dir = TempDir::new().unwrap();
        let logs = RunLogs::for_script(dir.path(), Path::new("job.sh"));
        fs::write(&logs.stdout, "out").unwrap();

        logs.mark_canceled().unwrap();
        assert!(dir.path().join("job.log.canceled").exists());
        assert!(!logs.stdout.exists());
    }
}
