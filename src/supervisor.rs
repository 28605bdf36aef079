use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Task {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

/// Runs the session loops and the bridge as independent tasks and enforces
/// the fatal-error policy: as soon as any task exits (cleanly, with an
/// error, or by panicking) the whole bridge is done. Reconnection is the
/// sessions' own business; the supervisor never restarts anything.
pub struct Supervisor {
    poll_interval: Duration,
    tasks: Vec<Task>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            tasks: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push(Task {
            name,
            handle: tokio::spawn(future),
        });
    }

    /// Poll task liveness until one exits, then resolve to the error that
    /// describes it. There is no success path; the caller turns the returned
    /// error into a non-zero process exit.
    pub async fn watch(mut self) -> anyhow::Error {
        if self.tasks.is_empty() {
            return anyhow!("supervisor started with no tasks");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;

            let finished = self.tasks.iter().position(|t| t.handle.is_finished());
            let Some(position) = finished else {
                continue;
            };

            let task = self.tasks.swap_remove(position);
            let err = match task.handle.await {
                Ok(Ok(())) => anyhow!("task '{}' exited unexpectedly", task.name),
                Ok(Err(err)) => err.context(format!("task '{}' failed", task.name)),
                Err(join_err) => anyhow!("task '{}' panicked: {}", task.name, join_err),
            };

            error!("Terminating: {:#}", err);
            for task in &self.tasks {
                task.handle.abort();
            }
            return err;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::future;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_terminates_the_supervisor() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("remote session", async { bail!("request queue closed") });

        let err = supervisor.watch().await;
        let message = format!("{:#}", err);
        assert!(message.contains("remote session"), "got: {}", message);
        assert!(message.contains("request queue closed"), "got: {}", message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_is_still_fatal() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("bridge", async { Ok(()) });

        let err = supervisor.watch().await;
        assert!(err.to_string().contains("exited unexpectedly"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_reported() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("source session", async { panic!("boom") });

        let err = supervisor.watch().await;
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_dead_task_suffices_despite_healthy_peers() {
        let mut supervisor = Supervisor::with_poll_interval(Duration::from_secs(1));
        supervisor.spawn("source session", async {
            future::pending::<()>().await;
            Ok(())
        });
        supervisor.spawn("remote session", async { bail!("loop returned") });

        // Must resolve within one poll interval even though the source
        // session task is still alive.
        let err = timeout(Duration::from_secs(2), supervisor.watch())
            .await
            .expect("supervisor did not notice the dead task in time");
        assert!(err.to_string().contains("remote session"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_keeps_waiting_while_all_tasks_live() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("source session", async {
            future::pending::<()>().await;
            Ok(())
        });
        supervisor.spawn("remote session", async {
            future::pending::<()>().await;
            Ok(())
        });

        let result = timeout(Duration::from_secs(5), supervisor.watch()).await;
        assert!(result.is_err(), "supervisor resolved with healthy tasks");
    }
}
