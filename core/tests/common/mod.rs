// Shared helpers for integration tests
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use weft_core::{Endpoint, Peer, RequestEnvelope, RequestHandler, Result};

/// Connection-shaped endpoint fronting one remote peer, the way a
/// server-side connection object fronts the client living behind it.
pub struct RelayEndpoint {
    id: String,
    remote: Arc<Peer>,
}

impl RelayEndpoint {
    pub fn new(id: &str, remote: Arc<Peer>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            remote,
        })
    }
}

#[async_trait]
impl Endpoint for RelayEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn knows_remote(&self, id: &str) -> bool {
        self.remote.id() == id
    }

    async fn deliver_locally(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>> {
        self.remote.deliver_locally(envelope).await
    }

    async fn forward(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>> {
        self.remote.deliver_locally(envelope).await
    }
}

/// Handler that answers with a fixed value after a delay.
pub struct SlowHandler {
    pub delay: Duration,
    pub value: Value,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle(
        &self,
        _payload: Option<Value>,
        _envelope: &RequestEnvelope,
    ) -> Result<Option<Value>> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(self.value.clone()))
    }
}
