//! Dev server supervision and the request-time bridge
//!
//! [`DevServerBridge::attach`] validates configuration, then spawns a single
//! supervisor task that:
//! 1. reserves a local port
//! 2. runs `<package-manager> run <script> -- --port <N>` in the source directory
//! 3. waits for the build success line on stdout
//! 4. probes `http://localhost:<N>/` until it answers
//! 5. publishes the URI (or the failure) to the shared [`TargetFuture`]
//!
//! After that the supervisor keeps ownership of the child until the
//! application shuts down, then stops it.

use crate::config::{ConfigError, DevServerConfig, ProbeConfig};
use crate::lines::{CapturedLines, LineWaitError};
use crate::port::find_available_port;
use crate::process::{DevServerProcess, ScriptCommand};
use crate::readiness::{shutdown_requested, wait_until_accepting, BuildSignal, HttpProbe};
use crate::target::{target_channel, GateError, StartupError, TargetFuture, TargetResolver};
use hyper::Uri;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to keep collecting stderr after stdout closes
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Where a ready dev server is listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub port: u16,
}

impl ServerInfo {
    /// `http://localhost:<port>/`
    pub fn uri(&self) -> Uri {
        // Only local, plain HTTP: the dev server has no certificate and is
        // never reached from another machine
        format!("http://localhost:{}/", self.port)
            .parse()
            .expect("localhost URI with numeric port is valid")
    }
}

/// Everything the supervisor task needs, resolved from config at attach time
struct Supervisor {
    source_path: PathBuf,
    script_name: String,
    command: ScriptCommand,
    env: HashMap<String, String>,
    build_signal: BuildSignal,
    probe: ProbeConfig,
    shutdown_grace_period: Duration,
}

impl Supervisor {
    async fn run(self, resolver: TargetResolver, mut shutdown: watch::Receiver<bool>) {
        let port = match find_available_port() {
            Ok(port) => port,
            Err(e) => {
                error!(error = %e, "Failed to reserve a port for the dev server");
                resolver.resolve(Err(StartupError::Launch(format!(
                    "no free local port: {}",
                    e
                ))));
                return;
            }
        };

        info!(port, script = %self.script_name, "Starting dev server");

        let extra_args = ["--port".to_string(), port.to_string()];
        let mut process =
            match DevServerProcess::launch(&self.source_path, &self.command, &extra_args, &self.env) {
                Ok(process) => process,
                Err(e) => {
                    error!(script = %self.script_name, error = %e, "Failed to launch dev server");
                    resolver.resolve(Err(StartupError::Launch(e.to_string())));
                    return;
                }
            };

        match self.wait_until_ready(&process, port, &mut shutdown).await {
            Ok(info) => {
                info!(port = info.port, "Dev server is ready");
                resolver.resolve(Ok(info.uri()));
            }
            Err(e) => {
                error!(script = %self.script_name, error = %e, "Dev server failed to start");
                resolver.resolve(Err(e));
                process.stop(self.shutdown_grace_period).await;
                return;
            }
        }

        let stop = tokio::select! {
            status = process.wait() => {
                match status {
                    Ok(status) => warn!(?status, "Dev server exited"),
                    Err(e) => warn!(error = %e, "Error waiting for dev server"),
                }
                false
            }
            _ = shutdown_requested(&mut shutdown) => true,
        };

        if stop {
            info!("Stopping dev server");
            process.stop(self.shutdown_grace_period).await;
        }
    }

    async fn wait_until_ready(
        &self,
        process: &DevServerProcess,
        port: u16,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ServerInfo, StartupError> {
        let mut stdout = process.stdout().subscribe();
        let stderr = CapturedLines::start(process.stderr().subscribe());

        let build = tokio::select! {
            result = self.build_signal.wait(&mut stdout) => result,
            _ = shutdown_requested(shutdown) => return Err(StartupError::ShuttingDown),
        };

        match build {
            Ok(line) => debug!(line = %line, "Build success signal seen"),
            Err(LineWaitError::EndOfStream) => {
                return Err(StartupError::ProcessExited {
                    script: self.script_name.clone(),
                    stderr: stderr.finish(STDERR_DRAIN_GRACE).await,
                });
            }
            Err(LineWaitError::Timeout(timeout)) => {
                return Err(StartupError::BuildSignalTimeout {
                    script: self.script_name.clone(),
                    timeout,
                });
            }
        }
        drop(stderr);

        // Even after the build line, the listener may not be bound yet
        let info = ServerInfo { port };
        let probe = HttpProbe::new();
        wait_until_accepting(&probe, &info.uri(), &self.probe, shutdown)
            .await
            .map_err(|_| StartupError::ShuttingDown)?;

        Ok(info)
    }
}

/// Connects the HTTP layer to a supervised dev server.
///
/// One bridge owns one dev server process for its whole lifetime. Startup is
/// attempted once; a failed startup stays failed until a new bridge is attached.
pub struct DevServerBridge {
    target: TargetFuture,
    startup_timeout: Duration,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DevServerBridge {
    /// Validate `config` and start the dev server in the background.
    ///
    /// Configuration errors are returned here, before anything is spawned.
    /// Must be called from within a tokio runtime.
    pub fn attach(
        config: &DevServerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pattern = config.build_signal_regex()?;
        let command = ScriptCommand::package_script(&config.package_manager, &config.script_name)
            .map_err(|e| ConfigError::InvalidPackageManager(e.to_string()))?;

        let supervisor = Supervisor {
            source_path: PathBuf::from(&config.source_path),
            script_name: config.script_name.clone(),
            command,
            env: config.env.clone(),
            build_signal: BuildSignal::new(pattern, config.build_signal_timeout()),
            probe: config.probe.clone(),
            shutdown_grace_period: config.shutdown_grace_period(),
        };

        let (resolver, target) = target_channel();
        let handle = tokio::spawn(supervisor.run(resolver, shutdown));

        info!(
            source_path = %config.source_path,
            script = %config.script_name,
            package_manager = %config.package_manager,
            "Dev server bridge attached"
        );

        Ok(Self {
            target,
            startup_timeout: config.startup_timeout(),
            supervisor: Mutex::new(Some(handle)),
        })
    }

    /// The shared startup outcome
    pub fn target(&self) -> &TargetFuture {
        &self.target
    }

    /// Configured per-request wait
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// The dev server URI, waiting at most `timeout` for startup to finish
    pub async fn get_target(&self, timeout: Duration) -> Result<Uri, GateError> {
        self.target.get(timeout).await
    }

    /// After shutdown has been signalled, wait up to `timeout` for the
    /// supervisor to stop the dev server.
    pub async fn wait_stopped(&self, timeout: Duration) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("Dev server supervisor finished"),
                Ok(Err(e)) => error!(error = %e, "Dev server supervisor panicked"),
                Err(_) => warn!(
                    timeout_secs = timeout.as_secs(),
                    "Dev server supervisor did not stop in time"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_uri() {
        let info = ServerInfo { port: 5173 };
        let uri = info.uri();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.host(), Some("localhost"));
        assert_eq!(uri.port_u16(), Some(5173));
        assert_eq!(uri.to_string(), "http://localhost:5173/");
    }

    #[tokio::test]
    async fn test_attach_rejects_empty_source_path() {
        let (_tx, rx) = watch::channel(false);
        let result = DevServerBridge::attach(&DevServerConfig::new("", "start"), rx);
        assert!(matches!(result, Err(ConfigError::EmptySourcePath)));
    }

    #[tokio::test]
    async fn test_attach_rejects_empty_script_name() {
        let (_tx, rx) = watch::channel(false);
        let result = DevServerBridge::attach(&DevServerConfig::new("ClientApp", ""), rx);
        assert!(matches!(result, Err(ConfigError::EmptyScriptName)));
    }

    #[tokio::test]
    async fn test_attach_rejects_bad_package_manager() {
        let (_tx, rx) = watch::channel(false);
        let config = DevServerConfig::new("ClientApp", "start").with_package_manager("'npm");
        let result = DevServerBridge::attach(&config, rx);
        assert!(matches!(result, Err(ConfigError::InvalidPackageManager(_))));
    }

    #[tokio::test]
    async fn test_missing_source_path_fails_launch() {
        let (_tx, rx) = watch::channel(false);
        let config = DevServerConfig::new("/nonexistent/devgate/client", "start");
        let bridge = DevServerBridge::attach(&config, rx).unwrap();

        let result = bridge.get_target(Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(GateError::Startup(StartupError::Launch(_)))
        ));
    }
}
