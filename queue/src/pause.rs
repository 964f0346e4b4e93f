use lazy_static::lazy_static;
use tracing::{event, Level};

use crate::error::Result;
use crate::keys::KeyNamer;

const PAUSE_RESUME_SCRIPT: &str = include_str!("scripts/pause_resume.lua");

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(PAUSE_RESUME_SCRIPT);
}

/// One atomic script flips `wait`/`paused`, the `meta-paused` flag and
/// publishes on both the paused and new-job channels. Pause state lives
/// entirely in Redis: there is no process-local flag, so two workers can
/// never disagree about whether the queue is paused.
#[derive(Clone, Copy)]
pub(crate) struct PauseResumeScript;

impl PauseResumeScript {
    pub(crate) fn new() -> Self {
        PauseResumeScript
    }

    pub(crate) async fn run(
        &self,
        keys: &KeyNamer,
        conn: &mut deadpool_redis::Connection,
        pausing: bool,
    ) -> Result<()> {
        let mode = if pausing { "paused" } else { "resumed" };
        let (source, dest) = if pausing {
            (keys.wait(), keys.paused())
        } else {
            (keys.paused(), keys.wait())
        };

        SCRIPT
            .key(source)
            .key(dest)
            .key(keys.meta_paused())
            .key(keys.paused_channel())
            .key(keys.jobs_channel())
            .key(keys.id())
            .arg(mode)
            .invoke_async(conn)
            .await?;

        event!(Level::INFO, queue = keys.name(), mode, "Queue pause state changed");
        Ok(())
    }
}
