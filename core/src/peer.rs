// Logically-addressed participant: handler registry + request surface
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backbone::{Backbone, BroadcastOptions, SendOptions};
use crate::correlation::CorrelationTable;
use crate::endpoint::{Endpoint, EndpointRef};
use crate::envelope::{ErrorInfo, RequestEnvelope};
use crate::{codes, Result, WeftError};

/// Handler invoked when a request named after its registration arrives.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        payload: Option<Value>,
        envelope: &RequestEnvelope,
    ) -> Result<Option<Value>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(Option<Value>) -> Result<Option<Value>> + Send + Sync,
{
    async fn handle(
        &self,
        payload: Option<Value>,
        _envelope: &RequestEnvelope,
    ) -> Result<Option<Value>> {
        (self.0)(payload)
    }
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Logical identity; generated when absent.
    pub id: Option<String>,
    /// Deadline before an outstanding request is abandoned.
    pub timeout: Duration,
    /// Verbose per-request tracing.
    pub debug: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            id: None,
            timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

/// One logically-addressed peer: the caller-facing surface of the system.
///
/// A peer owns a handler registry (name → ordered handler list), a set of
/// remote ids reachable behind it, and its own correlation table. Attached
/// to a [`Backbone`] it can invoke handlers registered anywhere in the
/// fleet; self-addressed calls dispatch locally without touching the
/// backbone. It is also the crate's reference [`Endpoint`] implementation.
pub struct Peer {
    id: String,
    debug: bool,
    handlers: DashMap<String, Vec<Arc<dyn RequestHandler>>>,
    remotes: DashMap<String, ()>,
    correlation: CorrelationTable,
    backbone: RwLock<Option<Arc<dyn Backbone>>>,
}

impl Peer {
    pub fn new(options: PeerOptions) -> Arc<Self> {
        let id = options.id.unwrap_or_else(crate::generate_id);
        Arc::new(Self {
            id,
            debug: options.debug,
            handlers: DashMap::new(),
            remotes: DashMap::new(),
            correlation: CorrelationTable::new(options.timeout),
            backbone: RwLock::new(None),
        })
    }

    /// Create a peer already attached (and registered) to a backbone.
    pub fn with_cluster(options: PeerOptions, backbone: Arc<dyn Backbone>) -> Arc<Self> {
        let peer = Self::new(options);
        peer.attach(backbone);
        peer
    }

    /// Register this peer on a backbone for cluster-wide routing lookups.
    pub fn attach(self: &Arc<Self>, backbone: Arc<dyn Backbone>) {
        let endpoint: EndpointRef = Arc::clone(self) as EndpointRef;
        backbone.register(&endpoint);
        *self.backbone.write().unwrap_or_else(|e| e.into_inner()) = Some(backbone);
        info!(target: "peer", id = %self.id, "attached to cluster backbone");
    }

    /// Unregister from the attached backbone, if any.
    pub fn detach(&self) {
        let backbone = self
            .backbone
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(backbone) = backbone {
            backbone.unregister(&self.id);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a handler; handlers for one name run in registration order
    /// and the last result becomes the reply.
    pub fn on(&self, name: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.entry(name.to_string()).or_default().push(handler);
    }

    /// Register a plain closure as handler.
    pub fn on_fn<F>(&self, name: &str, f: F)
    where
        F: Fn(Option<Value>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.on(name, Arc::new(FnHandler(f)));
    }

    /// Remove every handler registered under `name`.
    pub fn off(&self, name: &str) {
        self.handlers.remove(name);
    }

    /// Declare a remote id reachable behind this peer's connection.
    pub fn add_remote(&self, id: &str) {
        self.remotes.insert(id.to_string(), ());
    }

    pub fn remove_remote(&self, id: &str) {
        self.remotes.remove(id);
    }

    /// Invoke a named handler on `to` and await exactly one reply.
    pub async fn request(
        &self,
        name: &str,
        payload: Option<Value>,
        to: Option<&str>,
    ) -> Result<Option<Value>> {
        let envelope = RequestEnvelope::request(
            name,
            payload,
            Some(self.id.clone()),
            to.map(str::to_string),
        );
        if self.debug {
            debug!(target: "peer", id = %envelope.id, name = %name, to = ?to, "outbound request");
        }

        // Self-addressed calls never cross the backbone.
        if to == Some(self.id.as_str()) {
            let reply = self.dispatch(envelope).await;
            return match reply.er {
                Some(info) => Err(info.into()),
                None => Ok(reply.pl),
            };
        }

        let backbone = self
            .backbone
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(backbone) = backbone else {
            // No cluster and not addressed here: conclusively unroutable.
            return Err(WeftError::NoDestination(
                to.unwrap_or_default().to_string(),
            ));
        };

        let rx = self.correlation.track(&envelope.id);
        let id = envelope.id.clone();
        match backbone
            .handle_request(envelope, SendOptions::default())
            .await
        {
            // Request/response transport answered inline.
            Ok(Some(reply)) => {
                self.correlation.settle(&reply.id, reply.er, reply.pl);
            }
            // Reply will arrive through endpoint delivery.
            Ok(None) => {}
            Err(err) => {
                self.correlation.settle(&id, Some(err.to_info(&self.id)), None);
            }
        }

        let settlement = rx.await.map_err(|_| {
            WeftError::Internal(ErrorInfo::internal("pending request dropped", &self.id))
        })?;
        match settlement.error {
            Some(info) => Err(info.into()),
            None => Ok(settlement.payload),
        }
    }

    /// Fire-and-forget send: skips correlation and resolves immediately.
    pub async fn notify(&self, name: &str, payload: Option<Value>, to: Option<&str>) -> Result<()> {
        let envelope = RequestEnvelope::request(
            name,
            payload,
            Some(self.id.clone()),
            to.map(str::to_string),
        );
        if to == Some(self.id.as_str()) {
            let _ = self.dispatch(envelope).await;
            return Ok(());
        }
        let backbone = self
            .backbone
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(backbone) = backbone else {
            return Err(WeftError::NoDestination(
                to.unwrap_or_default().to_string(),
            ));
        };
        backbone
            .handle_request(envelope, SendOptions { no_reply: true })
            .await?;
        Ok(())
    }

    /// Issue one correlated request per destination concurrently.
    ///
    /// Every outcome is always awaited. Strict mode (default) rejects with
    /// the first failing destination's error (input order) once all have
    /// settled; tolerant mode maps failures to absent slots. The returned
    /// sequence preserves the caller-supplied destination order.
    pub async fn request_many(
        self: &Arc<Self>,
        name: &str,
        payload: Option<Value>,
        destinations: &[String],
        options: BroadcastOptions,
    ) -> Result<Vec<Option<Value>>> {
        let mut calls = JoinSet::new();
        for (slot, dest) in destinations.iter().enumerate() {
            let peer = Arc::clone(self);
            let name = name.to_string();
            let payload = payload.clone();
            let dest = dest.clone();
            let no_reply = options.no_reply;
            calls.spawn(async move {
                let outcome = if no_reply {
                    peer.notify(&name, payload, Some(&dest)).await.map(|_| None)
                } else {
                    peer.request(&name, payload, Some(&dest)).await
                };
                (slot, outcome)
            });
        }

        let mut slots: Vec<Option<Value>> = vec![None; destinations.len()];
        let mut first_error: Option<(usize, WeftError)> = None;
        while let Some(joined) = calls.join_next().await {
            let (slot, outcome) = joined.map_err(|e| {
                WeftError::Internal(ErrorInfo::internal(e.to_string(), &self.id))
            })?;
            match outcome {
                Ok(value) => slots[slot] = value,
                Err(err) => {
                    if self.debug {
                        debug!(target: "peer", slot, code = %err.code(), "fan-out destination failed");
                    }
                    if !options.continue_on_error {
                        let earlier = first_error.as_ref().map(|(s, _)| *s < slot).unwrap_or(false);
                        if !earlier {
                            first_error = Some((slot, err));
                        }
                    }
                }
            }
        }
        if let Some((_, err)) = first_error {
            return Err(err);
        }
        Ok(slots)
    }

    /// Fan out to every process currently known to the backbone.
    ///
    /// The roster is a snapshot taken at call time; processes joining
    /// afterwards are not included.
    pub async fn broadcast(
        self: &Arc<Self>,
        name: &str,
        payload: Option<Value>,
        options: BroadcastOptions,
    ) -> Result<Vec<Option<Value>>> {
        let backbone = self
            .backbone
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(backbone) = backbone else {
            return Err(WeftError::ClusterDisconnected);
        };
        let roster = backbone.roster().await?;
        self.request_many(name, payload, &roster, options).await
    }

    /// Run the local handler chain for a request and build its reply.
    async fn dispatch(&self, envelope: RequestEnvelope) -> RequestEnvelope {
        // Clone handlers out so no registry guard is held across await.
        let chain: Vec<Arc<dyn RequestHandler>> = match self.handlers.get(&envelope.nm) {
            Some(entry) => entry.clone(),
            None => Vec::new(),
        };
        if chain.is_empty() {
            return envelope.error_reply(
                ErrorInfo {
                    name: "WeftError".to_string(),
                    code: codes::NO_LISTENER.to_string(),
                    message: envelope.nm.clone(),
                    payload: Some(Value::String(self.id.clone())),
                },
                Some(&self.id),
            );
        }
        let mut result = None;
        for handler in chain {
            match handler.handle(envelope.pl.clone(), &envelope).await {
                Ok(value) => result = value,
                Err(err) => {
                    warn!(target: "peer", id = %self.id, name = %envelope.nm, error = %err, "handler failed");
                    return envelope
                        .error_reply(ErrorInfo::internal(err.to_string(), &self.id), Some(&self.id));
                }
            }
        }
        envelope.reply(result)
    }
}

#[async_trait]
impl Endpoint for Peer {
    fn id(&self) -> &str {
        &self.id
    }

    fn knows_remote(&self, id: &str) -> bool {
        self.remotes.contains_key(id)
    }

    async fn deliver_locally(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>> {
        if envelope.rq {
            Ok(Some(self.dispatch(envelope).await))
        } else {
            self.correlation.settle(&envelope.id, envelope.er, envelope.pl);
            Ok(None)
        }
    }

    async fn forward(&self, envelope: RequestEnvelope) -> Result<Option<RequestEnvelope>> {
        // A bare peer is terminal; declared remotes must be backed by a
        // real downstream connection object wrapping this one.
        Err(WeftError::Internal(ErrorInfo::internal(
            format!(
                "peer '{}' has no downstream hop for '{}'",
                self.id,
                envelope.to.as_deref().unwrap_or("")
            ),
            &self.id,
        )))
    }
}
