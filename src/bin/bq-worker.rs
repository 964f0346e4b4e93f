use anyhow::Result;
use async_trait::async_trait;
use bq_queue::{Handler, Job, Queue, RunOptions};
use bq_redis_support::RedisPool;
use bq_shutdown::GracefulShutdown;
use structopt::StructOpt;
use tracing::{event, Level};

#[derive(Debug, StructOpt)]
struct Args {
    /// Name of the queue to process jobs from.
    queue: String,

    #[structopt(long)]
    sequential: bool,
}

#[derive(Clone)]
struct PrintHandler;

#[async_trait]
impl Handler<serde_json::Value> for PrintHandler {
    async fn handle(&self, job: &Job<serde_json::Value>) -> Result<Option<serde_json::Value>> {
        event!(Level::INFO, job_id = job.id, data = %job.data, "Processing job");
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    bq::tracing_config::configure("bq-worker");

    let args = Args::from_args();
    let pool = RedisPool::new(None)?;
    let queue = Queue::<serde_json::Value>::new(pool, args.queue.clone());

    let shutdown = GracefulShutdown::new();

    queue.run(
        PrintHandler,
        shutdown.consumer(),
        RunOptions {
            force_sequential_processing: args.sequential,
        },
    );

    event!(Level::INFO, queue = %args.queue, "Worker started, waiting for Ctrl-C");
    shutdown.consumer().wait_for_shutdown().await;
    queue.stop().await;

    Ok(())
}
