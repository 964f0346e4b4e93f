use std::time::Duration;

use anyhow::{Context, Result};
use bq_queue::{JobOpts, Queue};
use bq_redis_support::RedisPool;
use structopt::StructOpt;
use tracing::{event, Level};

#[derive(Debug, StructOpt)]
struct Args {
    /// Name of the queue to add the job to.
    queue: String,

    /// JSON-encoded job payload.
    data: String,

    #[structopt(long)]
    lifo: bool,

    /// Delay, in milliseconds, before the job becomes runnable.
    #[structopt(long)]
    delay: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    bq::tracing_config::configure("bq-enqueue");

    let args = Args::from_args();
    let data: serde_json::Value =
        serde_json::from_str(&args.data).context("data must be valid JSON")?;

    let pool = RedisPool::new(None)?;
    let queue = Queue::<serde_json::Value>::new(pool, args.queue.clone());

    let mut opts = JobOpts::new();
    if args.lifo {
        opts = opts.lifo(true);
    }
    if let Some(delay) = args.delay {
        opts = opts.delay(Duration::from_millis(delay.max(0) as u64));
    }

    let job_id = queue.add(&data, Some(opts)).await?;
    event!(Level::INFO, queue = %args.queue, job_id, "Added job");
    println!("{}", job_id);

    Ok(())
}
