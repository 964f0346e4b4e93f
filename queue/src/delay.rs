use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::job::Codec;
use crate::notify::Subscription;
use crate::queue::Queue;

/// A single shared wake timer per queue. Any worker's timer may end up
/// doing the work; they are coordinator-free by construction, since
/// handling a due job republishes on the delayed channel and whichever
/// worker's timer wakes next (possibly the same one) picks up the remaining
/// work.
pub(crate) struct DelayTimer {
    closer: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DelayTimer {
    pub(crate) fn spawn<T, C>(queue: Queue<T, C>) -> Self
    where
        T: Send + Sync + 'static,
        C: Codec<T> + Clone + Send + Sync + 'static,
    {
        let (closer_tx, mut closer_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let channel = queue.delayed_channel_name();
            let client = queue.redis_client();

            let mut subscription = match Subscription::open(client, &channel).await {
                Ok(sub) => sub,
                Err(e) => {
                    event!(Level::ERROR, queue = queue.name(), error = %e, "Delay timer failed to subscribe, giving up");
                    return;
                }
            };

            let mut deadline: Option<Instant> = None;

            loop {
                let sleep = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    _ = &mut closer_rx => break,

                    payload = subscription.recv() => {
                        let Some(payload) = payload else { break };
                        if let Ok(wake_at_ms) = payload.parse::<i64>() {
                            let now_ms = crate::now_ms();
                            let wait_ms = (wake_at_ms - now_ms).max(0) as u64;
                            let candidate = Instant::now() + Duration::from_millis(wait_ms);
                            deadline = Some(match deadline {
                                Some(existing) if existing <= candidate => existing,
                                _ => candidate,
                            });
                        }
                    }

                    _ = sleep, if deadline.is_some() => {
                        deadline = None;
                        match queue.run_delay_poll().await {
                            Ok(Some(next_score)) => {
                                if let Err(e) = queue.publish_delay_wake(next_score).await {
                                    event!(Level::ERROR, queue = queue.name(), error = %e, "Failed to re-arm delay timer");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => event!(Level::ERROR, queue = queue.name(), error = %e, "Delay-poll script failed"),
                        }
                    }
                }
            }
        });

        DelayTimer {
            closer: Some(closer_tx),
            task,
        }
    }

    pub(crate) async fn stop(mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        let _ = self.task.await;
    }
}
