use std::time::Duration;

use bq_shutdown::GracefulShutdownConsumer;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::job::Codec;
use crate::queue::{Handler, Queue};
use crate::stalled;

const NEW_JOB_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Runs the get-next-job / run-one loop until told to stop.
///
/// Concurrency is controlled entirely by `force_sequential`: when true, each
/// job is awaited before the next is fetched; when false, every dispatched
/// job is spawned onto its own task and the aggregate in-flight count is
/// unbounded, left to the caller to manage.
pub(crate) fn spawn_dispatch_loop<T, C, H>(
    queue: Queue<T, C>,
    handler: H,
    mut shutdown: GracefulShutdownConsumer,
    mut closer_rx: oneshot::Receiver<()>,
    force_sequential: bool,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    C: Codec<T> + Clone + Send + Sync + 'static,
    H: Handler<T> + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let worker_token = uuid::Uuid::new_v4().to_string();

        if let Err(e) = stalled::recover_stalled_jobs(&queue, &worker_token, &handler).await {
            event!(Level::ERROR, queue = queue.name(), error = %e, "Stalled-job recovery failed");
        }

        let mut notifications = match queue.subscribe_new_job_notifications().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                event!(Level::WARN, queue = queue.name(), error = %e, "Dispatch loop falling back to poll-only mode");
                None
            }
        };

        let shutdown_fut = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown_fut);

        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_fut => break,
                _ = &mut closer_rx => break,

                Some(res) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = res {
                        event!(Level::ERROR, queue = queue.name(), error = %e, "Job task panicked");
                    }
                    continue;
                }

                job = queue.get_next_job(notifications.as_mut(), NEW_JOB_WAIT_TIMEOUT) => {
                    match job {
                        Ok(Some(job_id)) => {
                            let run = queue.clone().run_one(job_id, worker_token.clone(), handler.clone());
                            if force_sequential {
                                run.await;
                            } else {
                                let handle: JoinHandle<()> = tokio::spawn(run);
                                in_flight.push(handle);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            event!(Level::ERROR, queue = queue.name(), error = %e, "Error dequeueing job");
                        }
                    }
                }
            }
        }

        while let Some(res) = in_flight.next().await {
            if let Err(e) = res {
                event!(Level::ERROR, queue = queue.name(), error = %e, "Job task panicked during shutdown drain");
            }
        }
    })
}
