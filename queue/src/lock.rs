use std::time::Duration;

use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{event, Level};

use crate::job::Codec;
use crate::queue::Queue;

pub(crate) const LOCK_TTL: Duration = Duration::from_millis(5000);
pub(crate) const LOCK_RENEW_INTERVAL: Duration = Duration::from_millis(2500);

/// Keeps a job's lock alive for as long as its handler runs.
///
/// Callers must take the lock themselves before spawning this: the first
/// tick here is only the *renewal* cadence, not the initial acquisition, so
/// there is no window between dispatch and the first renewal where the
/// lock key doesn't exist yet.
///
/// Always pair `spawn` with `stop`: dropping this without stopping it
/// leaves the renewal task running forever.
pub(crate) struct LockRenewer {
    closer: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LockRenewer {
    pub(crate) fn spawn<T, C>(queue: Queue<T, C>, job_id: u64, token: String) -> Self
    where
        T: Send + Sync + 'static,
        C: Codec<T> + Clone + Send + Sync + 'static,
    {
        let (closer_tx, mut closer_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOCK_RENEW_INTERVAL);
            interval.tick().await; // first tick fires immediately, skip it

            loop {
                tokio::select! {
                    biased;

                    _ = &mut closer_rx => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.take_lock(job_id, &token, true).await {
                            event!(Level::ERROR, job_id, queue = queue.name(), error = %e, "Failed to renew job lock");
                        }
                    }
                }
            }
        });

        LockRenewer {
            closer: Some(closer_tx),
            task,
        }
    }

    /// Stops the renewer and waits for it to exit. Deliberately does not
    /// perform one last renewal on the way out: the handler is already done
    /// with the job, and an extra renewal here could resurrect a lock that
    /// stalled-job recovery has since reassigned to another worker.
    pub(crate) async fn stop(mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        let _ = self.task.await;
    }
}
