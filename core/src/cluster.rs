// Cluster router over the pub/sub backbone + partial-failure aggregation
use std::collections::HashSet;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backbone::{Backbone, BackboneEvent, SendOptions};
use crate::directory::{EndpointDirectory, Resolution};
use crate::endpoint::EndpointRef;
use crate::envelope::{codes, ErrorInfo, RequestEnvelope, NAMESPACE};
use crate::pubsub::{Broker, PubSubClient, PubSubClientOptions};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ClusterRouterOptions {
    /// Logical identity of this process; generated when absent.
    pub id: Option<String>,
    /// Shared pub/sub channel name.
    pub channel: String,
    /// Deadline for correlated requests and for reclaiming abandoned
    /// partial-failure entries.
    pub timeout: Duration,
    /// Verbose per-message tracing.
    pub debug: bool,
}

impl Default for ClusterRouterOptions {
    fn default() -> Self {
        Self {
            id: None,
            channel: NAMESPACE.to_string(),
            timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

/// Per-broadcast tracking of which live processes have not yet answered.
struct PendingBroadcast {
    remaining: HashSet<String>,
    origin: RequestEnvelope,
    deadline: JoinHandle<()>,
}

/// Multi-process router over one shared pub/sub channel.
///
/// Every process sees every message; this router resolves each inbound
/// envelope against its local endpoints, answers `NoDestination` claims
/// for requests it cannot place, and, for broadcasts it initiated,
/// aggregates those claims so the caller gets a conclusive "no destination
/// anywhere" error only after every process known at broadcast time has
/// had its chance. Any other reply is conclusive immediately.
pub struct ClusterRouter {
    client: Arc<PubSubClient>,
    directory: EndpointDirectory,
    pending: DashMap<String, PendingBroadcast>,
    weak: RwLock<Weak<ClusterRouter>>,
    timeout: Duration,
    debug: bool,
}

impl ClusterRouter {
    /// Attach to the broker and start routing inbound channel traffic.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        options: ClusterRouterOptions,
    ) -> Result<Arc<Self>> {
        let (client, mut inbound) = PubSubClient::connect(
            broker,
            PubSubClientOptions {
                id: options.id,
                channel: options.channel,
                direct_only: false,
                debug: options.debug,
            },
        )
        .await?;

        let router = Arc::new(Self {
            client,
            directory: EndpointDirectory::new(),
            pending: DashMap::new(),
            weak: RwLock::new(Weak::new()),
            timeout: options.timeout,
            debug: options.debug,
        });
        *router.weak.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&router);
        info!(target: "cluster", id = %router.client.id(), "cluster router attached");

        let weak = Arc::downgrade(&router);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let Some(router) = weak.upgrade() else { break };
                // slow local handlers must not stall channel consumption
                tokio::spawn(async move {
                    router.on_message(envelope).await;
                });
            }
        });
        Ok(router)
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    async fn on_message(&self, envelope: RequestEnvelope) {
        if !envelope.rq && self.absorb_partial(&envelope) {
            return;
        }
        self.route(envelope).await;
    }

    /// Aggregator step for inbound replies with a pending broadcast entry.
    ///
    /// Returns `true` when the reply was withheld (a non-conclusive claim).
    /// Conclusive replies discard the entry and fall through to normal
    /// routing.
    fn absorb_partial(&self, envelope: &RequestEnvelope) -> bool {
        if !self.pending.contains_key(&envelope.id) {
            return false;
        }
        if envelope.is_no_destination() {
            let concluded = match self.pending.get_mut(&envelope.id) {
                Some(mut entry) => {
                    if let Some(reporter) = envelope.er.as_ref().and_then(|e| e.reporter()) {
                        trace!(target: "cluster", id = %envelope.id, reporter = %reporter, "no-destination claim");
                        entry.remaining.remove(reporter);
                    }
                    entry.remaining.is_empty()
                }
                None => false,
            };
            if concluded {
                // every known process reported non-delivery
                self.conclude_no_destination(&envelope.id);
            }
            true
        } else {
            if let Some((_, entry)) = self.pending.remove(&envelope.id) {
                entry.deadline.abort();
                if self.debug {
                    debug!(target: "cluster", id = %envelope.id, "conclusive reply, aggregation done");
                }
            }
            false
        }
    }

    /// Synthesize the final `NoDestination` error for a pending broadcast
    /// and hand it to the local caller.
    fn conclude_no_destination(&self, id: &str) {
        let Some((_, entry)) = self.pending.remove(id) else {
            return;
        };
        entry.deadline.abort();
        let destination = entry.origin.to.clone().unwrap_or_default();
        let reply = entry.origin.error_reply(
            ErrorInfo::new(codes::NO_DESTINATION, destination),
            Some(self.client.id()),
        );
        let weak = self.weak.read().unwrap_or_else(|e| e.into_inner()).clone();
        tokio::spawn(async move {
            if let Some(router) = weak.upgrade() {
                router.route(reply).await;
            }
        });
    }

    /// Resolve one inbound envelope against the local endpoints.
    async fn route(&self, envelope: RequestEnvelope) {
        let was_request = envelope.rq;
        match self.directory.resolve(envelope.to.as_deref()) {
            Resolution::HandledHere(endpoint) => {
                let outcome = endpoint.deliver_locally(envelope.clone()).await;
                self.answer(&envelope, was_request, outcome).await;
            }
            Resolution::ForwardVia(endpoint) => {
                let outcome = endpoint.forward(envelope.clone()).await;
                self.answer(&envelope, was_request, outcome).await;
            }
            Resolution::Unresolvable if was_request => {
                // claim non-delivery so the initiator can strike us off
                let claim = envelope.error_reply(
                    ErrorInfo {
                        name: "WeftError".to_string(),
                        code: codes::NO_DESTINATION.to_string(),
                        message: envelope.to.clone().unwrap_or_default(),
                        payload: Some(Value::String(self.client.id().to_string())),
                    },
                    Some(self.client.id()),
                );
                if let Err(err) = self.client.send(&claim).await {
                    warn!(target: "cluster", error = %err, "failed to publish no-destination claim");
                }
            }
            Resolution::Unresolvable => {
                trace!(target: "cluster", id = %envelope.id, to = ?envelope.to, "reply not for this process, dropped");
            }
        }
    }

    /// Publish whatever a local delivery produced back on the channel.
    async fn answer(
        &self,
        origin: &RequestEnvelope,
        was_request: bool,
        outcome: Result<Option<RequestEnvelope>>,
    ) {
        match outcome {
            Ok(Some(reply)) if was_request => {
                if let Err(err) = self.client.send(&reply).await {
                    warn!(target: "cluster", error = %err, "failed to publish reply");
                }
            }
            Ok(_) => {}
            Err(err) if was_request => {
                let reply = origin
                    .error_reply(err.to_info(self.client.id()), Some(self.client.id()));
                if let Err(err) = self.client.send(&reply).await {
                    warn!(target: "cluster", error = %err, "failed to publish error reply");
                }
            }
            Err(err) => {
                warn!(target: "cluster", error = %err, "relay of reply failed");
            }
        }
    }
}

#[async_trait]
impl Backbone for ClusterRouter {
    fn register(&self, endpoint: &EndpointRef) {
        self.directory.register(endpoint);
    }

    fn unregister(&self, id: &str) {
        self.directory.unregister(id);
    }

    async fn handle_request(
        &self,
        envelope: RequestEnvelope,
        options: SendOptions,
    ) -> Result<Option<RequestEnvelope>> {
        if envelope.rq && !options.no_reply {
            // Seed partial-failure tracking from a roster snapshot taken
            // before the very first broadcast of this request.
            let roster = self.client.roster().await?;
            let remaining: HashSet<String> = roster.into_iter().collect();
            if self.debug {
                debug!(target: "cluster", id = %envelope.id, processes = remaining.len(), "broadcasting request");
            }
            let weak = self.weak.read().unwrap_or_else(|e| e.into_inner()).clone();
            let timer_id = envelope.id.clone();
            let timeout = self.timeout;
            let deadline = tokio::spawn(async move {
                // coarse cleanup against roster drift mid-flight
                tokio::time::sleep(timeout).await;
                if let Some(router) = weak.upgrade() {
                    router.conclude_no_destination(&timer_id);
                }
            });
            let empty = remaining.is_empty();
            self.pending.insert(
                envelope.id.clone(),
                PendingBroadcast {
                    remaining,
                    origin: envelope.clone(),
                    deadline,
                },
            );
            if empty {
                self.conclude_no_destination(&envelope.id);
                return Ok(None);
            }
        }
        self.client.send(&envelope).await?;
        Ok(None)
    }

    async fn roster(&self) -> Result<Vec<String>> {
        self.client.roster().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BackboneEvent> {
        self.client.subscribe_events()
    }
}
