pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod facade;
pub mod logging;
pub mod memory;
pub mod producer;

pub use backend::{handler_fn, Handler, HandlerError, HandlerResult, StreamBackend};
pub use codec::{Codec, JsonCodec, TypedMessage};
pub use config::{Config, LoggingConfig, MemoryConfig, PollerConfig, RedisStreamConfig};
pub use error::{Error, Result};
pub use facade::{ConsumerOptions, TypedStream};
pub use memory::MemoryBackend;
pub use producer::Producer;
