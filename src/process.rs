//! Launching and stopping the dev server child process

use crate::lines::{LineStream, StreamKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Errors raised while spawning the dev server
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("package manager command is empty")]
    EmptyCommand,
    #[error("failed to parse package manager command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },
    #[error("failed to start '{command}' in '{}': {source}", .working_dir.display())]
    Spawn {
        command: String,
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A package-manager script invocation, e.g. `npm run start --`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    program: String,
    args: Vec<String>,
}

impl ScriptCommand {
    /// Build `<package_manager> run <script> --`.
    ///
    /// `package_manager` may carry its own flags (`"pnpm --silent"`); it is
    /// split with shell quoting rules.
    pub fn package_script(package_manager: &str, script_name: &str) -> Result<Self, LaunchError> {
        let mut words = shell_words::split(package_manager).map_err(|e| {
            LaunchError::InvalidCommand {
                command: package_manager.to_string(),
                reason: e.to_string(),
            }
        })?;
        if words.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        words.extend(["run".to_string(), script_name.to_string(), "--".to_string()]);

        // npm and friends are .cmd shims on Windows and need the shell to resolve them
        #[cfg(windows)]
        {
            let mut args = vec!["/c".to_string()];
            args.extend(words);
            Ok(Self {
                program: "cmd".to_string(),
                args,
            })
        }

        #[cfg(not(windows))]
        {
            let program = words.remove(0);
            Ok(Self { program, args: words })
        }
    }

    /// Arbitrary command, mostly for tests and custom launchers
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument (builder pattern)
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The running dev server, with live views of its output.
///
/// On Unix the child leads its own process group, and stopping signals the
/// whole group: the package manager usually starts the real server as a
/// grandchild.
pub struct DevServerProcess {
    child: Child,
    /// Process group id, which is the child's pid
    pgid: Option<u32>,
    stdout: LineStream,
    stderr: LineStream,
}

impl DevServerProcess {
    /// Spawn `command` with `extra_args` appended, in `working_dir`.
    ///
    /// The child is killed if this handle is dropped without [`stop`](Self::stop).
    pub fn launch(
        working_dir: &Path,
        command: &ScriptCommand,
        extra_args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.args(extra_args);
        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        info!(pid, command = %command, ?extra_args, "Dev server process spawned");

        // Both pipes were requested above, so take() always yields them
        let stdout = match child.stdout.take() {
            Some(out) => LineStream::spawn(out, StreamKind::Stdout),
            None => LineStream::spawn(tokio::io::empty(), StreamKind::Stdout),
        };
        let stderr = match child.stderr.take() {
            Some(err) => LineStream::spawn(err, StreamKind::Stderr),
            None => LineStream::spawn(tokio::io::empty(), StreamKind::Stderr),
        };

        Ok(Self {
            pgid: child.id(),
            child,
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stdout(&self) -> &LineStream {
        &self.stdout
    }

    pub fn stderr(&self) -> &LineStream {
        &self.stderr
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Stop the process: SIGTERM, then SIGKILL once `grace_period` runs out.
    ///
    /// Both signals go to the whole process group, and a final SIGKILL sweeps
    /// up anything that outlived the direct child.
    pub async fn stop(&mut self, grace_period: Duration) {
        if self.child.id().is_some() {
            info!(pgid = self.pgid, "Sending SIGTERM to dev server");
            self.signal_group(Signal::Term);
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Dev server exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for dev server to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                self.signal_group(Signal::Kill);
                let _ = self.child.kill().await;
            }
        }

        self.signal_group(Signal::Kill);
        self.pgid = None;
    }

    fn signal_group(&mut self, signal: Signal) {
        #[cfg(unix)]
        {
            let Some(pgid) = self.pgid else {
                return;
            };
            let signo = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // SAFETY: pgid is the group created at spawn; ESRCH once it is empty
            let result = unsafe { libc::killpg(pgid as i32, signo) };
            if result == -1 && matches!(signal, Signal::Term) {
                let _ = self.child.start_kill();
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal;
            let _ = self.child.start_kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

impl Drop for DevServerProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the direct child
        if self.pgid.is_some() {
            self.signal_group(Signal::Kill);
        }
    }
}
