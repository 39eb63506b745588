use std::sync::Arc;
use tracing::debug;

use crate::backend::StreamBackend;
use crate::codec::TypedMessage;
use crate::error::Result;

/// Write-only handle that publishes [`TypedMessage`] values
///
/// Each message goes to the stream named by its `topic_id()`. A producer
/// never creates consumer groups and never consumes.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn StreamBackend<String>>,
}

impl Producer {
    #[must_use]
    pub fn new(backend: Arc<dyn StreamBackend<String>>) -> Self {
        Self { backend }
    }

    pub async fn offer<M: TypedMessage>(&self, message: &M) -> Result<()> {
        let topic_id = M::topic_id();
        let payload = M::codec().encode(message)?;
        self.backend.offer(topic_id, payload).await?;

        debug!(topic_id = %topic_id, "Produced message");
        Ok(())
    }
}
