// Pub/sub backbone plumbing: broker contract, in-memory broker, channel client
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::backbone::BackboneEvent;
use crate::envelope::{generate_id, RequestEnvelope, NAMESPACE};
use crate::Result;

/// Narrow contract consumed from the pub/sub broker.
///
/// One implementor instance stands for one logical broker connection:
/// naming the connection makes this process discoverable through
/// [`Broker::client_names`], which is how the roster query works without a
/// separate presence protocol. Connection retry and auth are the broker
/// client's own business.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, message: String) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// Tag this connection with a discoverable client name.
    async fn set_client_name(&self, name: &str) -> Result<()>;

    /// Names of every currently-connected named client.
    async fn client_names(&self) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()>;
}

/// Process-local broker for tests and demos.
///
/// Broadcast-to-all-subscribers per channel, with named connections so the
/// roster query behaves like a real broker's client list.
#[derive(Default)]
pub struct InMemoryBroker {
    channels: DashMap<String, Vec<mpsc::Sender<String>>>,
    names: DashMap<u64, String>,
    next_conn: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open one logical connection to this broker.
    pub fn handle(self: &Arc<Self>) -> MemoryBrokerHandle {
        MemoryBrokerHandle {
            broker: Arc::clone(self),
            conn: self.next_conn.fetch_add(1, Ordering::Relaxed),
        }
    }

    async fn deliver(&self, channel: &str, message: String) {
        // Senders are cloned out so no map guard is held across await.
        let senders: Vec<mpsc::Sender<String>> = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                entry.retain(|tx| !tx.is_closed());
                entry.clone()
            }
            None => return,
        };
        for tx in senders {
            if tx.send(message.clone()).await.is_err() {
                warn!(target: "broker", channel = %channel, "subscriber gone, message dropped");
            }
        }
    }
}

/// One logical connection to an [`InMemoryBroker`].
pub struct MemoryBrokerHandle {
    broker: Arc<InMemoryBroker>,
    conn: u64,
}

#[async_trait]
impl Broker for MemoryBrokerHandle {
    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        self.broker.deliver(channel, message).await;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(1024);
        self.broker
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn set_client_name(&self, name: &str) -> Result<()> {
        self.broker.names.insert(self.conn, name.to_string());
        Ok(())
    }

    async fn client_names(&self) -> Result<Vec<String>> {
        Ok(self.broker.names.iter().map(|e| e.value().clone()).collect())
    }

    async fn close(&self) -> Result<()> {
        self.broker.names.remove(&self.conn);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PubSubClientOptions {
    /// Logical identity of this process; generated when absent.
    pub id: Option<String>,
    /// Shared channel name, also used as the client-name prefix.
    pub channel: String,
    /// Single-hop client mode: discard inbound envelopes whose `to` is set
    /// and differs from our own id, instead of routing them.
    pub direct_only: bool,
    /// Verbose per-message tracing.
    pub debug: bool,
}

impl Default for PubSubClientOptions {
    fn default() -> Self {
        Self {
            id: None,
            channel: NAMESPACE.to_string(),
            direct_only: false,
            debug: false,
        }
    }
}

/// One process's attachment to the shared pub/sub channel.
///
/// Publishes namespace-stamped envelopes, filters inbound traffic by
/// namespace, and names its broker connection `<channel>:<id>` so the
/// roster query can enumerate live processes.
pub struct PubSubClient {
    id: String,
    channel: String,
    broker: Arc<dyn Broker>,
    events: broadcast::Sender<BackboneEvent>,
    ready: AtomicBool,
    debug: bool,
}

impl PubSubClient {
    /// Attach to the broker: name the connection, subscribe, start decoding.
    ///
    /// Returns the client and the stream of inbound envelopes that survived
    /// the namespace (and optional direct-only) filter.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        options: PubSubClientOptions,
    ) -> Result<(Arc<Self>, mpsc::Receiver<RequestEnvelope>)> {
        let id = options.id.unwrap_or_else(generate_id);
        let channel = options.channel;
        broker
            .set_client_name(&format!("{}:{}", channel, id))
            .await?;
        let mut raw = broker.subscribe(&channel).await?;

        let (events, _) = broadcast::channel(16);
        let client = Arc::new(Self {
            id: id.clone(),
            channel: channel.clone(),
            broker,
            events: events.clone(),
            ready: AtomicBool::new(true),
            debug: options.debug,
        });
        let _ = events.send(BackboneEvent::Ready);
        info!(target: "pubsub", id = %id, channel = %channel, "attached to channel");

        let (tx, rx) = mpsc::channel(1024);
        let direct_only = options.direct_only;
        let debug = options.debug;
        let own_id = id;
        tokio::spawn(async move {
            while let Some(frame) = raw.recv().await {
                let envelope: RequestEnvelope = match serde_json::from_str(&frame) {
                    Ok(env) => env,
                    Err(err) => {
                        warn!(target: "pubsub", error = %err, "undecodable frame dropped");
                        let _ = events.send(BackboneEvent::Error(err.to_string()));
                        continue;
                    }
                };
                // ns discriminates protocol traffic; the channel only
                // addresses the broker
                if envelope.ns != NAMESPACE {
                    continue;
                }
                if direct_only {
                    if let Some(to) = &envelope.to {
                        if to != &own_id {
                            continue;
                        }
                    }
                }
                if debug {
                    debug!(target: "pubsub", id = %envelope.id, name = %envelope.nm, rq = envelope.rq, "inbound envelope");
                }
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            let _ = events.send(BackboneEvent::End);
        });

        Ok((client, rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BackboneEvent> {
        self.events.subscribe()
    }

    /// Publish an envelope to the shared channel; every subscriber,
    /// including this process, receives it.
    pub async fn send(&self, envelope: &RequestEnvelope) -> Result<()> {
        let message = serde_json::to_string(envelope)?;
        if self.debug {
            debug!(target: "pubsub", id = %envelope.id, name = %envelope.nm, rq = envelope.rq, "publish");
        }
        self.broker.publish(&self.channel, message).await
    }

    /// Live process ids, derived from broker-side connection names tagged
    /// with our channel prefix.
    pub async fn roster(&self) -> Result<Vec<String>> {
        let prefix = format!("{}:", self.channel);
        let names = self.broker.client_names().await?;
        Ok(names
            .into_iter()
            .filter_map(|n| n.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::Relaxed);
        let _ = self.events.send(BackboneEvent::End);
        self.broker.close().await
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.ready.store(false, Ordering::Relaxed);
    }
}
