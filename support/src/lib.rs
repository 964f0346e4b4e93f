mod error;
mod pool;

pub use error::{Error, Result};
pub use pool::RedisPool;
