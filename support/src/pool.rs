use std::{env, ops::Deref, sync::Arc};

use crate::error::{Error, Result};

/// Wraps a pooled Redis connection factory alongside a standalone client
/// used only for pub/sub. A connection in subscriber mode cannot run
/// ordinary commands and must never be returned to the shared pool, so the
/// client that opens pub/sub connections is kept separate from it.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
    client: redis::Client,
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    pub fn new(connection: Option<String>) -> Result<RedisPool> {
        let redis_url = connection
            .or_else(|| env::var("REDIS_URL").ok())
            .ok_or_else(|| Error::Config("REDIS_URL is required".to_string()))?;

        let pool = deadpool_redis::Config {
            url: Some(redis_url.clone()),
            connection: None,
            pool: None,
        }
        .create_pool()?;

        let client = redis::Client::open(redis_url)?;

        Ok(RedisPool(Arc::new(RedisPoolInner { pool, client })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }

    /// A standalone client for opening pub/sub connections.
    pub fn client(&self) -> &redis::Client {
        &self.0.client
    }
}
