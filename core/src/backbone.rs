// Cluster backbone contract shared by the hub and pub/sub variants
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::endpoint::EndpointRef;
use crate::envelope::RequestEnvelope;
use crate::Result;

/// Lifecycle events surfaced for process supervision.
///
/// Plumbing failures (decode errors, broker loss) arrive here rather than
/// as request failures, unless they happen while actively answering a
/// specific request.
#[derive(Debug, Clone)]
pub enum BackboneEvent {
    Ready,
    Connect,
    Error(String),
    End,
}

/// Options for a single outbound send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Skip correlation entirely and resolve immediately with an empty
    /// payload; used for relay hops where no business reply is awaited.
    pub no_reply: bool,
}

/// Options for fan-out (`request_many` / `broadcast`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    pub no_reply: bool,
    /// Tolerant mode: map per-destination failures to absent slots instead
    /// of rejecting the whole call.
    pub continue_on_error: bool,
}

/// The cross-process transport carrying envelopes between processes.
///
/// Two interchangeable engines implement this contract: the hub
/// broadcast backbone ([`HubAgent`](crate::HubAgent)) and the pub/sub
/// router ([`ClusterRouter`](crate::ClusterRouter)); both maintain the
/// local endpoint registry and move locally-originated envelopes into the
/// cluster.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Attach a local endpoint for routing lookups (weak reference held).
    fn register(&self, endpoint: &EndpointRef);

    /// Detach a local endpoint by id.
    fn unregister(&self, id: &str);

    /// Carry a locally-originated envelope into the cluster.
    ///
    /// Returns `Some(reply)` when the transport is request/response (the
    /// hub answers inline); `None` when the reply will arrive later through
    /// endpoint delivery (pub/sub). Replies (`rq == false`) are relayed
    /// without awaiting anything.
    async fn handle_request(
        &self,
        envelope: RequestEnvelope,
        options: SendOptions,
    ) -> Result<Option<RequestEnvelope>>;

    /// Live set of process ids currently attached to the backbone.
    async fn roster(&self) -> Result<Vec<String>>;

    /// Subscribe to `ready`/`connect`/`error`/`end` lifecycle events.
    fn subscribe_events(&self) -> broadcast::Receiver<BackboneEvent>;
}
