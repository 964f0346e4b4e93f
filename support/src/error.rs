use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool creation error: {0}")]
    PoolCreation(#[from] deadpool_redis::CreatePoolError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
