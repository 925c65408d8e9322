// Weft Core Library
// Overlay addressing and request/reply routing across independently-scaled processes

pub mod backbone;
pub mod cluster;
pub mod correlation;
pub mod directory;
pub mod endpoint;
pub mod envelope;
pub mod hub;
pub mod peer;
pub mod pubsub;
pub mod telemetry;

// Export core types
pub use backbone::{Backbone, BackboneEvent, BroadcastOptions, SendOptions};
pub use cluster::{ClusterRouter, ClusterRouterOptions};
pub use correlation::{CorrelationTable, Settlement};
pub use directory::{EndpointDirectory, Resolution};
pub use endpoint::{Endpoint, EndpointRef};
pub use envelope::{codes, generate_id, ErrorInfo, RequestEnvelope, NAMESPACE};
pub use hub::{link_pair, HubAgent, HubAgentOptions, HubOptions, HubServer};
pub use peer::{Peer, PeerOptions, RequestHandler};
pub use pubsub::{Broker, InMemoryBroker, PubSubClient, PubSubClientOptions};

use thiserror::Error;

/// Error taxonomy observed by callers of `request`/`broadcast`.
///
/// Every error raised while answering a request travels as an [`ErrorInfo`]
/// inside a reply envelope and is rebuilt into a `WeftError` on the caller's
/// side; callers branch on [`WeftError::code`].
#[derive(Error, Debug)]
pub enum WeftError {
    /// Destination resolved locally but no handler is registered under the name.
    #[error("no listener for '{0}'")]
    NoListener(String),

    /// No process in the fleet could resolve the destination id.
    #[error("no destination '{0}'")]
    NoDestination(String),

    /// Hub broadcast exhausted all agents with no claim.
    #[error("no cluster route")]
    NoClusterRoute,

    /// Outbound call attempted while the uplink/backbone is not open.
    #[error("cluster disconnected")]
    ClusterDisconnected,

    /// No reply arrived within the configured deadline.
    #[error("request timed out")]
    Timeout,

    /// A handler failed while executing; carries the raising process id.
    #[error("{}: {}", .0.code, .0.message)]
    Internal(ErrorInfo),

    /// Broker-side plumbing failure (publish, subscribe, roster query).
    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;

impl WeftError {
    /// Stable wire code for this error kind.
    pub fn code(&self) -> &str {
        match self {
            WeftError::NoListener(_) => codes::NO_LISTENER,
            WeftError::NoDestination(_) => codes::NO_DESTINATION,
            WeftError::NoClusterRoute => codes::NO_CLUSTER_ROUTE,
            WeftError::ClusterDisconnected => codes::CLUSTER_DISCONNECTED,
            WeftError::Timeout => codes::TIMEOUT,
            WeftError::Internal(info) => &info.code,
            WeftError::Broker(_) | WeftError::Serialization(_) | WeftError::Io(_) => {
                codes::INTERNAL
            }
        }
    }

    /// Convert into the structured form carried by reply envelopes.
    ///
    /// `process` is the id of the process answering the request; it rides in
    /// the error payload so the caller can tell which hop failed.
    pub fn to_info(&self, process: &str) -> ErrorInfo {
        match self {
            WeftError::Internal(info) => info.clone(),
            other => ErrorInfo {
                name: "WeftError".to_string(),
                code: other.code().to_string(),
                message: other.to_string(),
                payload: Some(serde_json::Value::String(process.to_string())),
            },
        }
    }
}

impl From<ErrorInfo> for WeftError {
    fn from(info: ErrorInfo) -> Self {
        match info.code.as_str() {
            codes::NO_LISTENER => WeftError::NoListener(info.message),
            codes::NO_DESTINATION => WeftError::NoDestination(info.message),
            codes::NO_CLUSTER_ROUTE => WeftError::NoClusterRoute,
            codes::CLUSTER_DISCONNECTED => WeftError::ClusterDisconnected,
            codes::TIMEOUT => WeftError::Timeout,
            _ => WeftError::Internal(info),
        }
    }
}
