use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol namespace stamped on every envelope.
///
/// Discriminates weft traffic from unrelated messages sharing a transport or
/// broker channel; it doubles as the default channel name for the pub/sub
/// backbone.
pub const NAMESPACE: &str = "weft";

/// Reserved handler names used by the cluster plumbing.
///
/// These never collide with user handlers: the routing layers consume them
/// before local dispatch happens.
pub mod ops {
    /// Wraps an original envelope for transit across the cluster backbone.
    pub const FORWARD: &str = "_forward_";
    /// Relays an envelope down to a remote peer behind an endpoint.
    pub const REQUEST: &str = "_request_";
    /// Agent announces its process id to the hub after connecting.
    pub const HELLO: &str = "_hello_";
    /// Queries the live set of process ids known to the backbone.
    pub const ROSTER: &str = "_roster_";
}

/// Stable error codes carried in [`ErrorInfo::code`].
pub mod codes {
    pub const NO_LISTENER: &str = "NO_LISTENER";
    pub const NO_DESTINATION: &str = "NO_DESTINATION";
    pub const NO_CLUSTER_ROUTE: &str = "NO_CLUSTER_ROUTE";
    pub const CLUSTER_DISCONNECTED: &str = "CLUSTER_DISCONNECTED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Generate a fresh correlation id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Structured error carried inside a reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub code: String,
    pub message: String,
    /// Extra context; a `NoDestination` claim and an `Internal` error carry
    /// the reporting process id here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            name: "WeftError".to_string(),
            code: code.to_string(),
            message: message.into(),
            payload: None,
        }
    }

    /// Error raised by a handler, tagged with the process that raised it.
    pub fn internal(message: impl Into<String>, process: &str) -> Self {
        Self {
            name: "WeftError".to_string(),
            code: codes::INTERNAL.to_string(),
            message: message.into(),
            payload: Some(Value::String(process.to_string())),
        }
    }

    /// The reporting process id, when the payload carries one.
    pub fn reporter(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|v| v.as_str())
    }
}

/// The wire record correlating a call and its reply.
///
/// The same `id` travels unchanged through every hop; `rq` flips to `false`
/// once the envelope is converted to a reply. Transport-local state
/// (pending continuation, deadline timer) never rides in this struct; it
/// lives in the sender's [`CorrelationTable`](crate::CorrelationTable), so
/// an envelope is always safe to serialize as-is.
///
/// Field names match the wire format: `ns` namespace, `id` correlation id,
/// `nm` handler name, `rq` request flag, `pl` payload, `er` error, `fr`
/// sender, `to` destination. `to` may be absent when the caller does not
/// know which peer will answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub ns: String,
    pub id: String,
    pub nm: String,
    pub rq: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pl: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub er: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl RequestEnvelope {
    /// Build a fresh request with a generated correlation id.
    pub fn request(
        name: &str,
        payload: Option<Value>,
        from: Option<String>,
        to: Option<String>,
    ) -> Self {
        Self {
            ns: NAMESPACE.to_string(),
            id: generate_id(),
            nm: name.to_string(),
            rq: true,
            pl: payload,
            er: None,
            fr: from,
            to,
        }
    }

    /// Convert into a success reply: same id, `fr`/`to` swapped.
    pub fn reply(&self, payload: Option<Value>) -> Self {
        Self {
            ns: self.ns.clone(),
            id: self.id.clone(),
            nm: self.nm.clone(),
            rq: false,
            pl: payload,
            er: None,
            fr: self.to.clone(),
            to: self.fr.clone(),
        }
    }

    /// Convert into an error reply.
    ///
    /// `from` overrides the sender id when the error is manufactured by an
    /// intermediate hop rather than the addressed peer.
    pub fn error_reply(&self, error: ErrorInfo, from: Option<&str>) -> Self {
        Self {
            ns: self.ns.clone(),
            id: self.id.clone(),
            nm: self.nm.clone(),
            rq: false,
            pl: None,
            er: Some(error),
            fr: from.map(str::to_string).or_else(|| self.to.clone()),
            to: self.fr.clone(),
        }
    }

    /// True for a non-conclusive "no destination here" claim published by a
    /// process that could not resolve the destination.
    pub fn is_no_destination(&self) -> bool {
        !self.rq
            && self
                .er
                .as_ref()
                .map(|e| e.code == codes::NO_DESTINATION)
                .unwrap_or(false)
    }
}
