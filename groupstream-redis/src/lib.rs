pub mod redis_stream;

pub use redis_stream::RedisStreamBackend;
