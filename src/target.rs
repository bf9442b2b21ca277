//! The shared "where is the dev server" value
//!
//! A [`TargetResolver`] writes the outcome of the startup sequence exactly once;
//! any number of [`TargetFuture`] clones wait for it. Readers that arrive after
//! the write see the stored outcome immediately, so a failure is replayed to
//! every later request rather than retried.

use hyper::Uri;
use std::time::Duration;
use tokio::sync::watch;

/// Why the dev server never became ready. Terminal for the attachment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    /// The port could not be reserved or the process could not be spawned
    #[error("failed to launch the dev server: {0}")]
    Launch(String),

    /// The process ended before reporting a successful build
    #[error(
        "the script '{script}' exited without indicating that the dev server was listening for requests. The error output was: {stderr}"
    )]
    ProcessExited { script: String, stderr: String },

    /// The build success line never appeared
    #[error(
        "the script '{script}' did not report a successful build within {} seconds",
        display_secs(.timeout)
    )]
    BuildSignalTimeout { script: String, timeout: Duration },

    /// The application shut down first
    #[error("shutdown requested before the dev server became ready")]
    ShuttingDown,

    /// The supervisor went away without writing an outcome
    #[error("the dev server supervisor stopped without reporting an outcome")]
    SupervisorGone,
}

/// Failure of a single request's wait for the target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// This request gave up; the startup sequence keeps going
    #[error(
        "The dev server did not start listening for requests within the timeout period of {} seconds. Check the log output for error information.",
        display_secs(.timeout)
    )]
    Timeout { timeout: Duration },

    /// The startup sequence already failed
    #[error(transparent)]
    Startup(#[from] StartupError),
}

/// Seconds for messages: whole numbers stay whole, fractions keep up to
/// millisecond precision
fn display_secs(duration: &Duration) -> String {
    if duration.subsec_nanos() == 0 {
        return duration.as_secs().to_string();
    }
    let secs = format!("{:.3}", duration.as_secs_f64());
    secs.trim_end_matches('0').trim_end_matches('.').to_string()
}

pub type TargetOutcome = Result<Uri, StartupError>;

/// Write side of the target, consumed by its single write
pub struct TargetResolver {
    tx: watch::Sender<Option<TargetOutcome>>,
}

/// Read side of the target, cheap to clone into request handlers
#[derive(Clone)]
pub struct TargetFuture {
    rx: watch::Receiver<Option<TargetOutcome>>,
}

/// Create an unresolved target
pub fn target_channel() -> (TargetResolver, TargetFuture) {
    let (tx, rx) = watch::channel(None);
    (TargetResolver { tx }, TargetFuture { rx })
}

impl TargetResolver {
    pub fn resolve(self, outcome: TargetOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl TargetFuture {
    /// The outcome, if the startup sequence has finished
    pub fn peek(&self) -> Option<TargetOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the outcome with no time limit
    pub async fn wait(&self) -> TargetOutcome {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(StartupError::SupervisorGone))
    }

    /// Wait for the outcome, giving up after `timeout`.
    ///
    /// The timer is local to this call. Hitting it does not disturb the
    /// startup sequence or any other waiter.
    pub async fn get(&self, timeout: Duration) -> Result<Uri, GateError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(GateError::Timeout { timeout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(port: u16) -> Uri {
        format!("http://localhost:{}/", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolved_value_is_replayed() {
        let (resolver, target) = target_channel();
        assert!(target.peek().is_none());

        resolver.resolve(Ok(uri(5173)));

        assert_eq!(target.wait().await, Ok(uri(5173)));
        assert_eq!(target.wait().await, Ok(uri(5173)));
        assert_eq!(target.clone().wait().await, Ok(uri(5173)));
        assert_eq!(target.peek(), Some(Ok(uri(5173))));
    }

    #[tokio::test]
    async fn test_failure_is_replayed() {
        let (resolver, target) = target_channel();
        let err = StartupError::ProcessExited {
            script: "start".to_string(),
            stderr: "boom\n".to_string(),
        };
        resolver.resolve(Err(err.clone()));

        assert_eq!(target.wait().await, Err(err.clone()));
        assert_eq!(
            target.get(Duration::from_secs(1)).await,
            Err(GateError::Startup(err))
        );
    }

    #[tokio::test]
    async fn test_dropped_resolver_reports_supervisor_gone() {
        let (resolver, target) = target_channel();
        drop(resolver);
        assert_eq!(target.wait().await, Err(StartupError::SupervisorGone));
    }

    #[tokio::test]
    async fn test_timeout_does_not_poison_later_requests() {
        let (resolver, target) = target_channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            resolver.resolve(Ok(uri(4200)));
        });

        let started = std::time::Instant::now();
        let first = target.get(Duration::from_millis(200)).await;
        assert_eq!(
            first,
            Err(GateError::Timeout {
                timeout: Duration::from_millis(200)
            })
        );
        assert!(started.elapsed() < Duration::from_millis(450));

        let second = target.get(Duration::from_secs(5)).await;
        assert_eq!(second, Ok(uri(4200)));

        // Already resolved: returns without waiting
        let started = std::time::Instant::now();
        assert_eq!(target.get(Duration::from_secs(5)).await, Ok(uri(4200)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_agree() {
        let (resolver, target) = target_channel();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let target = target.clone();
                tokio::spawn(async move { target.get(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(Err(StartupError::BuildSignalTimeout {
            script: "start".to_string(),
            timeout: Duration::from_secs(300),
        }));

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(
                result,
                Err(GateError::Startup(StartupError::BuildSignalTimeout { .. }))
            ));
        }
    }

    #[tokio::test]
    async fn test_concurrent_waiters_get_same_uri() {
        let (resolver, target) = target_channel();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let target = target.clone();
                tokio::spawn(async move { target.get(Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(Ok(uri(5173)));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(uri(5173)));
        }
    }

    #[test]
    fn test_timeout_message_names_timeout() {
        let err = GateError::Timeout {
            timeout: Duration::from_secs(120),
        };
        let message = err.to_string();
        assert!(message.contains("timeout period of 120 seconds"));
        assert!(message.contains("Check the log output"));
    }

    #[test]
    fn test_sub_second_timeout_message() {
        let err = GateError::Timeout {
            timeout: Duration::from_millis(200),
        };
        assert!(err.to_string().contains("timeout period of 0.2 seconds"));

        let err = GateError::Timeout {
            timeout: Duration::from_millis(1500),
        };
        assert!(err.to_string().contains("timeout period of 1.5 seconds"));

        assert_eq!(display_secs(&Duration::from_millis(1)), "0.001");
        assert_eq!(display_secs(&Duration::from_secs(300)), "300");
    }

    #[test]
    fn test_process_exited_message_includes_stderr() {
        let err = StartupError::ProcessExited {
            script: "start".to_string(),
            stderr: "Error: Cannot find module 'webpack'".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("'start'"));
        assert!(message.contains("Cannot find module 'webpack'"));
    }
}
