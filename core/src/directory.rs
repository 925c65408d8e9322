// In-process directory of attached endpoints + address resolution
use std::sync::{RwLock, Weak};

use tracing::trace;

use crate::endpoint::{Endpoint, EndpointRef};

/// Routing decision for a destination id against the local directory.
pub enum Resolution {
    /// The destination is an endpoint attached to this process.
    HandledHere(EndpointRef),
    /// The destination sits behind this endpoint; relay via `forward`.
    ForwardVia(EndpointRef),
    /// No local endpoint claims the destination.
    Unresolvable,
}

/// Ordered registry of the endpoints attached to this process.
///
/// Holds weak references only. Endpoints register on creation and
/// unregister on close, and a dropped endpoint is pruned on the next
/// access. Mutations happen on the owning process's event loop, so a plain
/// `RwLock` around the ordered list is enough.
#[derive(Default)]
pub struct EndpointDirectory {
    endpoints: RwLock<Vec<Weak<dyn Endpoint>>>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: &EndpointRef) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|w| w.upgrade().is_some());
        endpoints.push(std::sync::Arc::downgrade(endpoint));
    }

    pub fn unregister(&self, id: &str) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|w| match w.upgrade() {
            Some(ep) => ep.id() != id,
            None => false,
        });
    }

    /// Live endpoints in registration order.
    pub fn snapshot(&self) -> Vec<EndpointRef> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Resolve a destination id against the registered endpoints.
    ///
    /// First matching endpoint in registration order wins; only one endpoint
    /// is expected to ever claim a given id (two claiming the same id is
    /// caller error, not guarded here). A missing destination id is
    /// unresolvable locally; "accept first claim" semantics only exist at
    /// the cluster level.
    pub fn resolve(&self, to: Option<&str>) -> Resolution {
        let Some(to) = to else {
            return Resolution::Unresolvable;
        };
        for endpoint in self.snapshot() {
            if endpoint.id() == to {
                return Resolution::HandledHere(endpoint);
            }
            if endpoint.knows_remote(to) {
                trace!(target: "directory", to = %to, via = %endpoint.id(), "destination behind endpoint");
                return Resolution::ForwardVia(endpoint);
            }
        }
        Resolution::Unresolvable
    }
}
