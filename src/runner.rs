// src/runner.rs
//
// =============================================================================
// WHIRR: PROCESS RUNNER
// =============================================================================
//
// Spawn argv directly (no shell interpolation), put the child in its own
// session/process group, arrange for it to die if we do (parent-death
// signal on Linux), tee stdout+stderr into `output.log`, and offer
// `poll`/`wait`/`kill(grace)` with graceful-then-forceful process-group
// termination. Output is wired straight to the log file via `Stdio::from`
// since nothing needs to read the stream in-process.

use anyhow::{Context, Result};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Parent-death signal + new session, installed in the child's `pre_exec`
/// hook so an orphaned child is killed rather than left running.
fn pre_exec() -> std::io::Result<()> {
    unsafe {
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub struct JobRunner {
    child: Child,
    pid: i32,
    pgid: i32,
}

impl JobRunner {
    /// Spawn `command_argv` in `workdir`, with `env` merged on top of the
    /// inherited environment, redirecting combined stdout+stderr to
    /// `run_dir/output.log` (created, truncated).
    pub async fn spawn(
        command_argv: &[String],
        workdir: &Path,
        run_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Self> {
        anyhow::ensure!(!command_argv.is_empty(), "command_argv must not be empty");

        let log_path = run_dir.join("output.log");
        let log_file = File::create(&log_path)
            .with_context(|| format!("failed to create {}", log_path.display()))?;
        let log_file_err = log_file.try_clone()?;

        let mut cmd = Command::new(&command_argv[0]);
        cmd.args(&command_argv[1..])
            .current_dir(workdir)
            .envs(env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        unsafe {
            cmd.pre_exec(pre_exec);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", command_argv))?;

        let pid = child
            .id()
            .context("child exited before its pid could be observed")? as i32;
        // The child called setsid() in pre_exec, so its pgid equals its pid.
        let pgid = pid;

        Ok(Self { child, pid, pgid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Non-blocking check for exit. `Ok(None)` means still running.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(exit_code_of(status))),
            None => Ok(None),
        }
    }

    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code_of(status))
    }

    /// Graceful-then-forceful termination of the whole process group.
    ///
    /// 1. If already exited, return its code.
    /// 2. SIGTERM the process group.
    /// 3. Poll for exit up to `grace_period`.
    /// 4. If still alive, SIGKILL the process group.
    /// 5. Wait up to 5s more.
    /// 6. Return the observed exit code, or the negated signal number if we
    ///    had to force it and no natural code is available.
    pub async fn kill(&mut self, grace_period: std::time::Duration) -> Result<i32> {
        if let Some(code) = self.poll()? {
            return Ok(code);
        }

        unsafe {
            libc::killpg(self.pgid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        while tokio::time::Instant::now() < deadline {
            if let Some(code) = self.poll()? {
                return Ok(code);
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        if self.poll()?.is_none() {
            unsafe {
                libc::killpg(self.pgid, libc::SIGKILL);
            }
        }

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if let Some(code) = self.poll()? {
                return Ok(code);
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        Ok(-libc::SIGKILL)
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| -status.signal().unwrap_or(0))
}

pub fn output_log_path(run_dir: &Path) -> PathBuf {
    run_dir.join("output.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_echo_completes_with_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::spawn(
            &["echo".to_string(), "hello".to_string()],
            Path::new("/tmp"),
            dir.path(),
            &[],
        )
        .await
        .unwrap();
        let code = runner.wait().await.unwrap();
        assert_eq!(code, 0);
        let contents = std::fs::read_to_string(output_log_path(dir.path())).unwrap();
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_its_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::spawn(
            &["sh".to_string(), "-c".to_string(), "exit 42".to_string()],
            Path::new("/tmp"),
            dir.path(),
            &[],
        )
        .await
        .unwrap();
        let code = runner.wait().await.unwrap();
        assert_eq!(code, 42);
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::spawn(
            &["sleep".to_string(), "30".to_string()],
            Path::new("/tmp"),
            dir.path(),
            &[],
        )
        .await
        .unwrap();
        let code = runner.kill(std::time::Duration::from_millis(500)).await.unwrap();
        assert!(code != 0);
    }
}
