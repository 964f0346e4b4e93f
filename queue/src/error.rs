use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error(transparent)]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error("job {0} has a malformed hash: missing required field `{1}`")]
    MalformedJob(u64, &'static str),

    #[error("job {0} not found")]
    NotFound(u64),

    #[error(
        "add/retry requires at least one subscriber on the queue's pub/sub channel, found none"
    )]
    NoSubscribers,
}

pub type Result<T> = std::result::Result<T, Error>;
