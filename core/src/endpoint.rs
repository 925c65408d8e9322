use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::RequestEnvelope;
use crate::Result;

/// One locally-attached duplex connection, addressable by logical id.
///
/// The routing core never owns endpoints: it keeps weak references in an
/// [`EndpointDirectory`](crate::EndpointDirectory) and expects the endpoint
/// to register on creation and unregister on close. Besides its own id, an
/// endpoint knows the ids of peers reachable only through further hops
/// behind it (e.g. a server-side connection knows the id of the browser
/// client on the other end).
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Whether `id` is reachable behind this endpoint.
    fn knows_remote(&self, id: &str) -> bool;

    /// Deliver an envelope addressed to this endpoint itself.
    ///
    /// Requests dispatch to the local handler registry and return
    /// `Some(reply)`; replies settle the endpoint's own correlation table
    /// and return `None`.
    async fn deliver_locally(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>>;

    /// Relay an envelope to a remote peer behind this endpoint.
    ///
    /// The endpoint maintains its own nested correlation for the downstream
    /// hop. Same return convention as [`Endpoint::deliver_locally`].
    async fn forward(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>>;
}

/// Shared trait-object handle used throughout the routing layers.
pub type EndpointRef = Arc<dyn Endpoint>;
