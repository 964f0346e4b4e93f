use lazy_static::lazy_static;

use crate::pause::PauseResumeScript;

const ADD_SCRIPT: &str = include_str!("scripts/add.lua");
const REMOVE_SCRIPT: &str = include_str!("scripts/remove.lua");
const RELEASE_LOCK_SCRIPT: &str = include_str!("scripts/release_lock.lua");
const RETRY_SCRIPT: &str = include_str!("scripts/retry.lua");
const DELAY_POLL_SCRIPT: &str = include_str!("scripts/delay_poll.lua");

lazy_static! {
    static ref ADD: redis::Script = redis::Script::new(ADD_SCRIPT);
    static ref REMOVE: redis::Script = redis::Script::new(REMOVE_SCRIPT);
    static ref RELEASE_LOCK: redis::Script = redis::Script::new(RELEASE_LOCK_SCRIPT);
    static ref RETRY: redis::Script = redis::Script::new(RETRY_SCRIPT);
    static ref DELAY_POLL: redis::Script = redis::Script::new(DELAY_POLL_SCRIPT);
}

/// Every Lua script is loaded once via `lazy_static` and reused for the
/// life of the process: `redis::Script` caches the SHA and falls back to
/// `EVAL` only on a cache miss.
#[derive(Clone, Copy)]
pub(crate) struct Scripts {
    pub(crate) add: &'static redis::Script,
    pub(crate) remove: &'static redis::Script,
    pub(crate) release_lock: &'static redis::Script,
    pub(crate) retry: &'static redis::Script,
    pub(crate) delay_poll: &'static redis::Script,
    pub(crate) pause_resume: PauseResumeScript,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Scripts {
            add: &ADD,
            remove: &REMOVE,
            release_lock: &RELEASE_LOCK,
            retry: &RETRY,
            delay_poll: &DELAY_POLL,
            pause_resume: PauseResumeScript::new(),
        }
    }
}
