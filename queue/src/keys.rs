//! Canonical `bull:<queue>:<kind>` key and channel names.
//!
//! This prefix is part of the wire contract with any peer implementation
//! sharing the same Redis instance: do not change it.

pub(crate) const PREFIX: &str = "bull";

#[derive(Clone, Debug)]
pub(crate) struct KeyNamer {
    name: String,
}

impl KeyNamer {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        KeyNamer { name: name.into() }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, kind: &str) -> String {
        format!("{}:{}:{}", PREFIX, self.name, kind)
    }

    pub(crate) fn id(&self) -> String {
        self.key("id")
    }

    pub(crate) fn wait(&self) -> String {
        self.key("wait")
    }

    pub(crate) fn active(&self) -> String {
        self.key("active")
    }

    pub(crate) fn paused(&self) -> String {
        self.key("paused")
    }

    pub(crate) fn delayed(&self) -> String {
        self.key("delayed")
    }

    pub(crate) fn completed(&self) -> String {
        self.key("completed")
    }

    pub(crate) fn failed(&self) -> String {
        self.key("failed")
    }

    pub(crate) fn meta_paused(&self) -> String {
        self.key("meta-paused")
    }

    pub(crate) fn job_hash(&self, job_id: u64) -> String {
        self.key(&job_id.to_string())
    }

    pub(crate) fn job_hash_prefix(&self) -> String {
        format!("{}:{}:", PREFIX, self.name)
    }

    pub(crate) fn lock(&self, job_id: u64) -> String {
        format!("{}:lock", self.job_hash(job_id))
    }

    pub(crate) fn jobs_channel(&self) -> String {
        self.key("jobs")
    }

    // Same physical key as `delayed()`: Redis keyspaces and pub/sub channel
    // namespaces are disjoint, and bull reuses the name for both.
    pub(crate) fn delayed_channel(&self) -> String {
        self.key("delayed")
    }

    pub(crate) fn paused_channel(&self) -> String {
        self.key("paused")
    }
}
