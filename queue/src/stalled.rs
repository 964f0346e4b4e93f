use tracing::{event, Level};

use crate::error::Result;
use crate::job::Codec;
use crate::queue::{Handler, Queue};

/// Adopts jobs left behind in `active` by a consumer that died without
/// releasing its lock. A job qualifies for recovery when taking
/// its lock with `renew = false` (set-if-absent) succeeds, which only
/// happens once the previous owner's lock has already expired, and the job
/// has not already reached `completed`.
pub(crate) async fn recover_stalled_jobs<T, C, H>(
    queue: &Queue<T, C>,
    worker_token: &str,
    handler: &H,
) -> Result<usize>
where
    T: Send + Sync + 'static,
    C: Codec<T> + Clone + Send + Sync + 'static,
    H: Handler<T> + Clone + Send + Sync + 'static,
{
    let active_ids = queue.active_job_ids().await?;
    let mut recovered = 0;

    for job_id in active_ids {
        let took_lock = queue.take_lock(job_id, worker_token, false).await?;
        if !took_lock {
            continue;
        }

        if queue.is_completed(job_id).await? {
            continue;
        }

        event!(Level::INFO, job_id, queue = queue.name(), "Recovering stalled job");
        queue
            .clone()
            .run_one(job_id, worker_token.to_string(), handler.clone())
            .await;
        recovered += 1;
    }

    Ok(recovered)
}
