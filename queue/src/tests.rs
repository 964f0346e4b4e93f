//! Redis-backed integration tests, gated behind the `test_redis` feature
//! and a live `REDIS_URL` loaded via `dotenv`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use bq_redis_support::RedisPool;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::job::JobOpts;
use crate::queue::Handler;
use crate::{Job, Queue};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Payload {
    value: u32,
}

/// Keeps a raw subscriber alive on the jobs channel so `add`/`retry` see at
/// least one subscriber, which both require.
struct SubscriberGuard {
    _task: tokio::task::JoinHandle<()>,
}

async fn subscribe_for_test(client: &redis::Client, channel: &str) -> SubscriberGuard {
    let mut pubsub = client.get_async_pubsub().await.expect("open pubsub");
    pubsub.subscribe(channel).await.expect("subscribe");
    let task = tokio::spawn(async move {
        let mut stream = pubsub.into_on_message();
        use futures::StreamExt;
        while stream.next().await.is_some() {}
    });
    SubscriberGuard { _task: task }
}

async fn run_queue_test<F, Fut>(test: F)
where
    F: FnOnce(Queue<Payload>, redis::Client) -> Fut + Send,
    Fut: Future<Output = ()>,
{
    dotenv::dotenv().ok();
    let queue_name = format!("test-{}", uuid::Uuid::new_v4());
    let pool = RedisPool::new(None).expect("creating redis pool");
    let client = pool.client().clone();
    let queue = Queue::<Payload>::new(pool.clone(), queue_name.clone());

    let result = AssertUnwindSafe(test(queue, client)).catch_unwind().await;

    let mut conn = pool.get().await.expect("cleanup: acquiring connection");
    let key_pattern = format!("bull:{}:*", queue_name);
    let mut cmd = redis::cmd("SCAN");
    let mut iter: redis::AsyncIter<String> = cmd
        .cursor_arg(0)
        .arg("MATCH")
        .arg(&key_pattern)
        .arg("COUNT")
        .arg(100)
        .clone()
        .iter_async(&mut conn)
        .await
        .expect("cleanup: scanning keyspace");

    let mut del_cmd = redis::cmd("DEL");
    let mut any = false;
    while let Some(key) = iter.next_item().await {
        any = true;
        del_cmd.arg(key);
    }
    if any {
        del_cmd
            .query_async::<_, ()>(&mut conn)
            .await
            .expect("cleanup: deleting keys");
    }

    result.expect("test panicked");
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn fifo_order_by_default() {
    run_queue_test(|queue, client| async move {
        let _sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        let mut ids = Vec::new();
        for i in 0..7u32 {
            let id = queue
                .add(&Payload { value: i }, None)
                .await
                .expect("add job");
            ids.push(id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids increase monotonically");

        // The left-push-on-add / right-pop-on-dispatch pair is what makes
        // the default mode FIFO: dispatch order must follow add order, not
        // just id order (ids increase regardless of fifo/lifo).
        let mut dispatched = Vec::new();
        for _ in 0..7 {
            let job_id = queue
                .get_next_job(None, Duration::from_millis(10))
                .await
                .expect("pop job")
                .expect("a job was waiting");
            dispatched.push(job_id);
        }

        assert_eq!(dispatched, ids, "default mode dispatches in first-in-first-out order");
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn lifo_listing_is_ascending_by_right_push() {
    run_queue_test(|queue, client| async move {
        let _sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        let opts = JobOpts::new().lifo(true);
        let mut ids = Vec::new();
        for i in 0..7u32 {
            let id = queue
                .add(&Payload { value: i }, Some(opts.clone()))
                .await
                .expect("add job");
            ids.push(id);
        }

        let waiting = queue.get_waiting().await.expect("get waiting");
        assert_eq!(waiting, ids, "right-push keeps getWaiting in ascending id order");
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn retry_after_failure_reenqueues_onto_wait() {
    struct FailOnce;

    #[async_trait]
    impl Handler<Payload> for FailOnce {
        async fn handle(&self, _job: &Job<Payload>) -> anyhow::Result<Option<serde_json::Value>> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    run_queue_test(|queue, client| async move {
        let _sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        let id = queue
            .add(&Payload { value: 1 }, None)
            .await
            .expect("add job");

        // Simulate a dispatched job running to failure directly, bypassing
        // the dispatch loop so the test stays deterministic.
        queue
            .clone()
            .run_one(id, "test-worker".to_string(), FailOnce)
            .await;

        let failed = queue.get_failed().await.expect("get failed");
        assert_eq!(failed, vec![id]);

        queue.retry(id).await.expect("retry job");

        let failed = queue.get_failed().await.expect("get failed after retry");
        assert!(failed.is_empty());

        let waiting = queue.get_waiting().await.expect("get waiting after retry");
        assert_eq!(waiting, vec![id]);
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn stalled_job_recovery_adopts_orphaned_active_job() {
    struct Recorder(std::sync::Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl Handler<Payload> for Recorder {
        async fn handle(&self, _job: &Job<Payload>) -> anyhow::Result<Option<serde_json::Value>> {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(None)
        }
    }

    run_queue_test(|queue, client| async move {
        let _sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        let id = queue
            .add(&Payload { value: 1 }, None)
            .await
            .expect("add job");

        // Move it into active directly, simulating a worker that popped the
        // job and then died before ever taking or renewing its lock.
        let next = queue.get_next_job(None, Duration::from_millis(10)).await.expect("pop job");
        assert_eq!(next, Some(id));

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        crate::stalled::recover_stalled_jobs(&queue, "recovering-worker", &Recorder(ran.clone()))
            .await
            .expect("recover stalled jobs");

        assert!(ran.load(std::sync::atomic::Ordering::SeqCst), "handler ran for the stalled job");

        let completed = queue.get_completed().await.expect("get completed");
        assert_eq!(completed, vec![id]);
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn job_counts_reflect_each_container() {
    run_queue_test(|queue, client| async move {
        let _sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        queue.add(&Payload { value: 1 }, None).await.expect("add job");
        queue
            .add(&Payload { value: 2 }, Some(JobOpts::new().delay(Duration::from_secs(60))))
            .await
            .expect("add delayed job");

        let counts = queue.job_counts().await.expect("job counts");
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.failed, 0);
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn pause_then_resume_keeps_new_jobs_out_of_wait() {
    run_queue_test(|queue, client| async move {
        let _jobs_sub = subscribe_for_test(&client, &format!("bull:{}:jobs", queue.name())).await;

        let before = queue
            .add(&Payload { value: 1 }, None)
            .await
            .expect("add before pause");

        queue.pause().await.expect("pause");

        let during = queue
            .add(&Payload { value: 2 }, None)
            .await
            .expect("add while paused");

        let counts = queue.job_counts().await.expect("job counts while paused");
        assert_eq!(counts.waiting, 0, "wait must stay empty while the queue is paused");
        assert_eq!(
            counts.paused, 2,
            "both the pre-pause job and the job added while paused must land in `paused`"
        );

        queue.resume().await.expect("resume");

        let mut dispatched = Vec::new();
        for _ in 0..2 {
            let job_id = queue
                .get_next_job(None, Duration::from_millis(10))
                .await
                .expect("pop job")
                .expect("a job was waiting");
            dispatched.push(job_id);
        }

        assert_eq!(
            dispatched,
            vec![before, during],
            "resumed queue dispatches pre-pause and paused-in additions in FIFO order"
        );
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a live Redis, run with --ignored under the test_redis feature"]
async fn delayed_jobs_promote_in_ascending_delay_order() {
    run_queue_test(|queue, client| async move {
        let _delayed_sub =
            subscribe_for_test(&client, &format!("bull:{}:delayed", queue.name())).await;

        let delays_ms = [100u64, 1100, 1900, 300, 1700, 900, 500, 1300, 700, 1500];
        let mut ids_by_delay = Vec::new();
        for &delay in &delays_ms {
            let id = queue
                .add(
                    &Payload { value: delay as u32 },
                    Some(JobOpts::new().delay(Duration::from_millis(delay))),
                )
                .await
                .expect("add delayed job");
            ids_by_delay.push((delay, id));
        }

        ids_by_delay.sort_by_key(|(delay, _)| *delay);
        let expected_ids: Vec<u64> = ids_by_delay.into_iter().map(|(_, id)| id).collect();

        // Let every delay elapse, then drive the same delay-poll script
        // `DelayTimer` calls on each wake, repeatedly, exactly as it would
        // across a chain of re-arms.
        tokio::time::sleep(Duration::from_millis(2200)).await;
        while queue.run_delay_poll().await.expect("delay poll").is_some() {}

        let waiting = queue.get_waiting().await.expect("get waiting after delay poll");
        assert_eq!(
            waiting, expected_ids,
            "delayed jobs promote to wait in ascending delay order, not add order"
        );
    })
    .await;
}
