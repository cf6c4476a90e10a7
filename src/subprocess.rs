//! Thin wrapper around `std::process::Command` for invoking `git`, with
//! process-group isolation and deadline-aware kill so a killed fetch
//! can't leave descendant processes running past the loop iteration
//! that spawned them.
//!
//! Always invokes git with an explicit `-C <path>`, environment, and
//! cancellation-aware wait rather than relying on process cwd.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use camino::Utf8Path;

use crate::cancel::Deadline;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct GitRunner {
    pub git_binary: Utf8PathBuf,
    pub base_env: Vec<(String, String)>,
}

use camino::Utf8PathBuf;

impl GitRunner {
    pub fn new(git_binary: impl Into<Utf8PathBuf>, base_env: Vec<(String, String)>) -> Self {
        Self {
            git_binary: git_binary.into(),
            base_env,
        }
    }

    fn command(&self, cwd: &Utf8Path, args: &[&str], extra_env: &[(String, String)]) -> Command {
        let mut cmd = Command::new(self.git_binary.as_str());
        cmd.current_dir(cwd.as_str())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.base_env {
            cmd.env(k, v);
        }
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    /// Runs `git <args>` in `cwd`, waiting up to `deadline`. Returns stdout
    /// as a lossily-decoded string on success; on non-zero exit or
    /// deadline expiry the process (and its process group, on unix) is
    /// killed and a descriptive error returned.
    pub fn run(
        &self,
        cwd: &Utf8Path,
        args: &[&str],
        extra_env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<String> {
        let output = self.run_raw(cwd, args, extra_env, deadline)?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    pub fn run_raw(
        &self,
        cwd: &Utf8Path,
        args: &[&str],
        extra_env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<Vec<u8>> {
        if deadline.is_expired() {
            return Err(Error::Cancelled);
        }

        let mut cmd = self.command(cwd, args, extra_env);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(cwd.to_path_buf(), e))?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = Vec::new();
                    let mut stderr = String::new();
                    if let Some(mut out) = child.stdout.take() {
                        let _ = out.read_to_end(&mut stdout);
                    }
                    if let Some(mut err) = child.stderr.take() {
                        let _ = err.read_to_string(&mut stderr);
                    }
                    if status.success() {
                        return Ok(stdout);
                    }
                    return Err(Error::CommandFailed {
                        cwd: cwd.to_string(),
                        reason: format!(
                            "git {:?} exited with {status}: {}",
                            args,
                            stderr.trim()
                        ),
                    });
                }
                Ok(None) => {
                    if deadline.is_expired() {
                        kill_process_group(&mut child);
                        let _ = child.wait();
                        return Err(Error::Cancelled);
                    }
                    let wait = deadline
                        .remaining()
                        .map(|r| r.min(POLL_INTERVAL))
                        .unwrap_or(POLL_INTERVAL);
                    std::thread::sleep(wait);
                }
                Err(e) => return Err(Error::io(cwd.to_path_buf(), e)),
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut std::process::Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut std::process::Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn runs_a_trivial_command_successfully() {
        let runner = GitRunner::new("echo", Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8Path::from_path(dir.path()).unwrap();
        let out = runner
            .run(cwd, &["hello"], &[], &Deadline::none())
            .unwrap();
        assert!(out.contains("hello"));
    }

    #[test]
    fn propagates_nonzero_exit_as_command_failed() {
        let runner = GitRunner::new("false", Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8Path::from_path(dir.path()).unwrap();
        let err = runner.run(cwd, &[], &[], &Deadline::none()).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn kills_on_expired_deadline() {
        let runner = GitRunner::new("sleep", Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8Path::from_path(dir.path()).unwrap();
        let deadline = Deadline::after(StdDuration::from_millis(50));
        let err = runner
            .run(cwd, &["30"], &[], &deadline)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
