mod delay;
mod dispatch;
mod error;
mod events;
mod job;
mod keys;
mod lock;
mod notify;
mod pause;
mod queue;
mod scripts;
mod stalled;

#[cfg(test)]
mod tests;

pub use self::error::{Error, Result};
pub use self::events::{EventHub, QueueEvent};
pub use self::job::{Codec, Job, JobOpts, JsonCodec};
pub use self::queue::{Handler, JobCounts, Queue, RunOptions};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
