//! Supervised background tasks. Every task runs under one shutdown token and reports its
//! failure, tagged with the task's name, to the [`Supervisor`] owning that token.

use std::future::Future;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Spawner {
    failures: UnboundedSender<crate::Error>,
    token: CancellationToken,
}

impl Spawner {
    /// Runs `task` until it finishes or the supervisor shuts down. An `Err` or a panic is
    /// reported; a task stopped by shutdown reports nothing.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let failures = self.failures.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(task);
        let abort = handle.abort_handle();
        tokio::spawn(async move {
            let joined = tokio::select! {
                joined = handle => joined,
                () = token.cancelled() => {
                    abort.abort();
                    debug!(task = %name, "stopped on shutdown");
                    return
                }
            };
            let failure = match joined {
                Ok(Ok(())) => {
                    debug!(task = %name, "finished");
                    return;
                }
                Ok(Err(err)) => err.context(format!("task {name} failed")),
                Err(err) if err.is_panic() => crate::err!("task {name} panicked"),
                Err(_) => return,
            };
            if let Err(unreported) = failures.send(failure) {
                warn!("{:#} after supervisor shut down", unreported.0)
            }
        });
    }
}

/// Owner of a group of spawned tasks. Dropping it shuts them all down.
#[derive(Debug)]
pub struct Supervisor {
    // held so that the channel stays open while no task is running
    failures: UnboundedSender<crate::Error>,
    reports: UnboundedReceiver<crate::Error>,
    token: CancellationToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        let (failures, reports) = unbounded_channel();
        Self {
            failures,
            reports,
            token: CancellationToken::new(),
        }
    }
}

impl Supervisor {
    pub fn spawner(&self) -> Spawner {
        Spawner {
            failures: self.failures.clone(),
            token: self.token.clone(),
        }
    }

    /// Waits for the first task failure, then shuts every other task down.
    pub async fn first_failure(&mut self) -> crate::Error {
        let failure = match self.reports.recv().await {
            Some(failure) => failure,
            None => crate::err!("failure channel closed"),
        };
        self.shutdown();
        failure
    }

    pub fn shutdown(&self) {
        self.token.cancel()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn first_failure_names_task_and_stops_the_rest() {
        let mut supervisor = Supervisor::default();
        let spawner = supervisor.spawner();
        let (alive, stopped) = oneshot::channel::<()>();
        spawner.spawn("idle", async move {
            let _alive = alive;
            std::future::pending::<()>().await;
            Ok(())
        });
        spawner.spawn("faulty", async { Err(crate::err!("disk on fire")) });
        let failure = format!("{:#}", supervisor.first_failure().await);
        assert!(failure.contains("task faulty failed"));
        assert!(failure.contains("disk on fire"));
        // aborting the idle task drops its sender
        assert!(stopped.await.is_err());
    }

    #[tokio::test]
    async fn panic_is_reported() {
        let mut supervisor = Supervisor::default();
        supervisor.spawner().spawn("doomed", async {
            if true {
                panic!("invariant broken")
            }
            Ok(())
        });
        let failure = supervisor.first_failure().await;
        assert!(failure.to_string().contains("task doomed panicked"));
    }

    #[tokio::test]
    async fn shutdown_reports_nothing() {
        let mut supervisor = Supervisor::default();
        supervisor.spawner().spawn("idle", std::future::pending());
        supervisor.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.reports.try_recv().is_err());
    }
}
