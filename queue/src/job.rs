use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Converts a payload to and from the bytes stored in a job's `data` field.
///
/// Kept as a trait rather than requiring `Serialize`/`Deserialize` directly
/// on `Queue<T>` so a caller can plug in a non-JSON wire format while still
/// getting JSON by default, which is what keeps us wire-compatible with
/// JSON-speaking peers out of the box.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A job's wire-visible options: a string map rather than a fixed struct,
/// so an option added by a peer implementation round-trips even when we
/// don't recognize it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobOpts(HashMap<String, String>);

impl JobOpts {
    pub fn new() -> Self {
        JobOpts(HashMap::new())
    }

    pub fn lifo(mut self, lifo: bool) -> Self {
        if lifo {
            self.0.insert("lifo".to_string(), "true".to_string());
        } else {
            self.0.remove("lifo");
        }
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.0
            .insert("delay".to_string(), (delay.as_millis() as u64).to_string());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.0.insert(
            "timestamp".to_string(),
            timestamp.timestamp_millis().to_string(),
        );
        self
    }

    pub fn is_lifo(&self) -> bool {
        self.0.get("lifo").map(|v| v == "true").unwrap_or(false)
    }

    /// Per spec §6, `opts.delay` is parsed as a float number of
    /// milliseconds (not necessarily an integer literal).
    pub fn delay_ms(&self) -> Result<Option<i64>> {
        self.0
            .get("delay")
            .map(|v| v.parse::<f64>().map(|f| f as i64))
            .transpose()
            .map_err(Error::from)
    }

    /// Per spec §6, `opts.timestamp` is parsed as a float ms-since-epoch.
    pub fn timestamp_ms(&self) -> Result<Option<i64>> {
        self.0
            .get("timestamp")
            .map(|v| v.parse::<f64>().map(|f| f as i64))
            .transpose()
            .map_err(Error::from)
    }

    pub(crate) fn encode(&self) -> Result<String> {
        if self.0.is_empty() {
            Ok(String::new())
        } else {
            Ok(serde_json::to_string(&self.0)?)
        }
    }

    pub(crate) fn decode(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw == "null" {
            return Ok(JobOpts::new());
        }
        let map: HashMap<String, String> = serde_json::from_str(raw)?;
        Ok(JobOpts(map))
    }
}

/// A job's durable state, read back from its Redis hash.
///
/// Field access is by name, not position: a peer implementation is free to
/// add or reorder hash fields without breaking us.
#[derive(Clone, Debug)]
pub struct Job<T> {
    pub id: u64,
    pub data: T,
    pub opts: JobOpts,
    pub progress: u32,
    pub timestamp: i64,
    pub delay: Option<i64>,
    pub stacktrace: Option<String>,
}

impl<T> Job<T> {
    pub fn is_lifo(&self) -> bool {
        self.opts.is_lifo()
    }
}
