// Hub broadcast backbone: one relay process fanning out to agent uplinks
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::backbone::{Backbone, BackboneEvent, SendOptions};
use crate::correlation::CorrelationTable;
use crate::directory::{EndpointDirectory, Resolution};
use crate::endpoint::EndpointRef;
use crate::envelope::{generate_id, ops, ErrorInfo, RequestEnvelope};
use crate::{Result, WeftError};

/// One half of an in-memory full-duplex link.
///
/// Stands in for the reconnecting transport the real deployment would use;
/// the routing layers only ever see open/close state and text frames.
pub struct DuplexLink {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    open: Arc<AtomicBool>,
}

/// Create a connected pair of link halves sharing one open/closed state.
pub fn link_pair() -> (DuplexLink, DuplexLink) {
    let (a_tx, b_rx) = mpsc::channel(256);
    let (b_tx, a_rx) = mpsc::channel(256);
    let open = Arc::new(AtomicBool::new(true));
    (
        DuplexLink {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(Some(a_rx)),
            open: Arc::clone(&open),
        },
        DuplexLink {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(Some(b_rx)),
            open,
        },
    )
}

impl DuplexLink {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Close both halves; pending reads end once the sender drops.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(WeftError::ClusterDisconnected);
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(WeftError::ClusterDisconnected)?;
        tx.send(frame)
            .await
            .map_err(|_| WeftError::ClusterDisconnected)
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<String>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Handler for a reserved operation arriving on one link.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<Option<Value>>;
}

/// Point-to-point request/reply protocol over one duplex link.
///
/// Both ends of every hub connection run one of these: envelope framing,
/// per-link handler registration by name, and id-based correlation for
/// replies. Handlers run on their own task so a slow dispatch never blocks
/// the read loop.
pub struct RpcLink {
    label: String,
    link: DuplexLink,
    correlation: CorrelationTable,
    handlers: DashMap<String, Arc<dyn LinkHandler>>,
    events: broadcast::Sender<BackboneEvent>,
}

impl RpcLink {
    pub fn spawn(link: DuplexLink, timeout: Duration, label: String) -> Arc<Self> {
        let receiver = link.take_receiver();
        let (events, _) = broadcast::channel(16);
        let rpc = Arc::new(Self {
            label,
            link,
            correlation: CorrelationTable::new(timeout),
            handlers: DashMap::new(),
            events: events.clone(),
        });
        let _ = events.send(BackboneEvent::Connect);
        if let Some(mut rx) = receiver {
            let weak = Arc::downgrade(&rpc);
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let Some(rpc) = weak.upgrade() else { break };
                    rpc.on_frame(frame);
                }
                if let Some(rpc) = weak.upgrade() {
                    rpc.link.close();
                    let _ = rpc.events.send(BackboneEvent::End);
                    debug!(target: "hub", label = %rpc.label, "link closed");
                }
            });
        }
        rpc
    }

    pub fn on(&self, name: &str, handler: Arc<dyn LinkHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn close(&self) {
        self.link.close();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BackboneEvent> {
        self.events.subscribe()
    }

    /// Send a reserved-name request over the link.
    ///
    /// With `no_reply` set the call skips correlation and resolves
    /// immediately with an empty payload.
    pub async fn request(
        &self,
        name: &str,
        payload: Option<Value>,
        options: SendOptions,
    ) -> Result<Option<Value>> {
        if !self.is_open() {
            return Err(WeftError::ClusterDisconnected);
        }
        let envelope = RequestEnvelope::request(name, payload, None, None);
        if options.no_reply {
            self.send(&envelope).await?;
            return Ok(None);
        }
        let rx = self.correlation.track(&envelope.id);
        let id = envelope.id.clone();
        if let Err(err) = self.send(&envelope).await {
            self.correlation
                .settle(&id, Some(err.to_info(&self.label)), None);
        }
        let settlement = rx.await.map_err(|_| WeftError::ClusterDisconnected)?;
        match settlement.error {
            Some(info) => Err(info.into()),
            None => Ok(settlement.payload),
        }
    }

    async fn send(&self, envelope: &RequestEnvelope) -> Result<()> {
        let frame = serde_json::to_string(envelope)?;
        self.link.send(frame).await
    }

    fn on_frame(self: Arc<Self>, frame: String) {
        let envelope: RequestEnvelope = match serde_json::from_str(&frame) {
            Ok(env) => env,
            Err(err) => {
                warn!(target: "hub", label = %self.label, error = %err, "undecodable frame dropped");
                let _ = self.events.send(BackboneEvent::Error(err.to_string()));
                return;
            }
        };
        if !envelope.rq {
            self.correlation.settle(&envelope.id, envelope.er, envelope.pl);
            return;
        }
        let handler = self.handlers.get(&envelope.nm).map(|h| Arc::clone(h.value()));
        let rpc = self;
        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => match handler.handle(envelope.clone()).await {
                    Ok(payload) => envelope.reply(payload),
                    Err(err) => envelope.error_reply(err.to_info(&rpc.label), None),
                },
                None => envelope.error_reply(
                    ErrorInfo::new(crate::codes::NO_LISTENER, envelope.nm.clone()),
                    None,
                ),
            };
            if let Err(err) = rpc.send(&reply).await {
                trace!(target: "hub", label = %rpc.label, error = %err, "reply not deliverable");
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Deadline for each per-agent leg of a fan-out.
    pub timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

struct AgentEntry {
    rpc: Arc<RpcLink>,
    announced: RwLock<Option<String>>,
    seq: u64,
}

/// The central relay process of the hub topology.
///
/// Holds no business logic: every `_forward_` request from one agent fans
/// out to all other currently-open agents, and the first non-empty answer
/// wins. Agents disconnecting mid-broadcast count as empty answers.
pub struct HubServer {
    agents: DashMap<String, AgentEntry>,
    seq: AtomicU64,
    timeout: Duration,
}

impl HubServer {
    pub fn new(options: HubOptions) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            seq: AtomicU64::new(0),
            timeout: options.timeout,
        })
    }

    /// Accept a newly-connected agent uplink.
    pub fn accept(self: &Arc<Self>, link: DuplexLink) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("agent-{seq}");
        let rpc = RpcLink::spawn(link, self.timeout, format!("hub:{key}"));
        let hub = Arc::downgrade(self);
        rpc.on(
            ops::HELLO,
            Arc::new(HelloHandler {
                hub: hub.clone(),
                agent: key.clone(),
            }),
        );
        rpc.on(
            ops::FORWARD,
            Arc::new(ForwardHandler {
                hub: hub.clone(),
                agent: key.clone(),
            }),
        );
        rpc.on(ops::ROSTER, Arc::new(RosterHandler { hub: hub.clone() }));

        // prune the entry once the uplink ends
        let mut events = rpc.subscribe_events();
        let watch_key = key.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, BackboneEvent::End) {
                    if let Some(hub) = hub.upgrade() {
                        hub.remove(&watch_key);
                    }
                    break;
                }
            }
        });

        info!(target: "hub", agent = %key, "agent connected");
        self.agents.insert(
            key.clone(),
            AgentEntry {
                rpc,
                announced: RwLock::new(None),
                seq,
            },
        );
        key
    }

    pub fn remove(&self, key: &str) {
        if self.agents.remove(key).is_some() {
            info!(target: "hub", agent = %key, "agent removed");
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Announced process ids of the connected agents.
    pub fn roster(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter_map(|e| {
                e.value()
                    .announced
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
            })
            .collect()
    }

    /// Relay an inner envelope to every other open agent and return the
    /// first non-empty answer in connection order.
    async fn fan_out(&self, from: &str, inner: Value) -> Result<Option<Value>> {
        let mut targets: Vec<(u64, Arc<RpcLink>)> = self
            .agents
            .iter()
            .filter(|e| e.key() != from && e.value().rpc.is_open())
            .map(|e| (e.value().seq, Arc::clone(&e.value().rpc)))
            .collect();
        targets.sort_by_key(|(seq, _)| *seq);
        let count = targets.len();

        let mut legs = JoinSet::new();
        for (idx, (_, rpc)) in targets.into_iter().enumerate() {
            let inner = inner.clone();
            legs.spawn(async move {
                (idx, rpc.request(ops::FORWARD, Some(inner), SendOptions::default()).await)
            });
        }

        // always await every leg; answers are considered in connection
        // order, not completion order
        let mut answers: Vec<Option<Value>> = vec![None; count];
        while let Some(joined) = legs.join_next().await {
            if let Ok((idx, outcome)) = joined {
                match outcome {
                    Ok(answer) => answers[idx] = answer,
                    Err(err) => {
                        trace!(target: "hub", error = %err, "agent leg failed, counted as empty");
                    }
                }
            }
        }
        match answers.into_iter().flatten().next() {
            Some(answer) => Ok(Some(answer)),
            None => Err(WeftError::NoClusterRoute),
        }
    }
}

struct HelloHandler {
    hub: Weak<HubServer>,
    agent: String,
}

#[async_trait]
impl LinkHandler for HelloHandler {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<Option<Value>> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(None);
        };
        if let (Some(entry), Some(Value::String(id))) =
            (hub.agents.get(&self.agent), envelope.pl)
        {
            debug!(target: "hub", agent = %self.agent, id = %id, "agent announced");
            *entry
                .announced
                .write()
                .unwrap_or_else(|p| p.into_inner()) = Some(id);
        }
        Ok(None)
    }
}

struct ForwardHandler {
    hub: Weak<HubServer>,
    agent: String,
}

#[async_trait]
impl LinkHandler for ForwardHandler {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<Option<Value>> {
        let hub = self.hub.upgrade().ok_or(WeftError::ClusterDisconnected)?;
        let inner = envelope.pl.ok_or_else(|| {
            WeftError::Internal(ErrorInfo::internal("forward without inner envelope", "hub"))
        })?;
        hub.fan_out(&self.agent, inner).await
    }
}

struct RosterHandler {
    hub: Weak<HubServer>,
}

#[async_trait]
impl LinkHandler for RosterHandler {
    async fn handle(&self, _envelope: RequestEnvelope) -> Result<Option<Value>> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(None);
        };
        let ids = hub.roster().into_iter().map(Value::String).collect();
        Ok(Some(Value::Array(ids)))
    }
}

#[derive(Debug, Clone)]
pub struct HubAgentOptions {
    /// Process id announced to the hub; generated when absent.
    pub id: Option<String>,
    /// Deadline for correlated uplink requests.
    pub timeout: Duration,
    /// Verbose per-message tracing.
    pub debug: bool,
}

impl Default for HubAgentOptions {
    fn default() -> Self {
        Self {
            id: None,
            timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

/// One process's attachment to the hub: a single uplink plus the local
/// endpoint registry.
pub struct HubAgent {
    id: String,
    rpc: Arc<RpcLink>,
    directory: Arc<EndpointDirectory>,
    debug: bool,
}

impl HubAgent {
    /// Attach to the hub over `link` and announce this process's id.
    pub async fn connect(link: DuplexLink, options: HubAgentOptions) -> Result<Arc<Self>> {
        let id = options.id.unwrap_or_else(generate_id);
        let rpc = RpcLink::spawn(link, options.timeout, id.clone());
        let agent = Arc::new(Self {
            id: id.clone(),
            rpc: Arc::clone(&rpc),
            directory: Arc::new(EndpointDirectory::new()),
            debug: options.debug,
        });
        rpc.on(
            ops::FORWARD,
            Arc::new(AgentForwardHandler {
                id: id.clone(),
                directory: Arc::clone(&agent.directory),
                debug: options.debug,
            }),
        );
        rpc.request(
            ops::HELLO,
            Some(Value::String(id)),
            SendOptions { no_reply: true },
        )
        .await?;
        info!(target: "hub", id = %agent.id, "agent uplink established");
        Ok(agent)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.rpc.is_open()
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}

/// Agent-side handling of the hub's re-publish: unwrap the inner envelope
/// and try to place it locally; absence (not an error) tells the hub to
/// keep searching other agents.
struct AgentForwardHandler {
    id: String,
    directory: Arc<EndpointDirectory>,
    debug: bool,
}

#[async_trait]
impl LinkHandler for AgentForwardHandler {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<Option<Value>> {
        let Some(inner) = envelope.pl else {
            return Ok(None);
        };
        let inner: RequestEnvelope = serde_json::from_value(inner)?;
        if self.debug {
            debug!(target: "hub", id = %self.id, inner_id = %inner.id, to = ?inner.to, "forward received");
        }
        let outcome = match self.directory.resolve(inner.to.as_deref()) {
            Resolution::HandledHere(endpoint) => endpoint.deliver_locally(inner).await?,
            Resolution::ForwardVia(endpoint) => endpoint.forward(inner).await?,
            Resolution::Unresolvable => None,
        };
        match outcome {
            Some(reply) => Ok(Some(serde_json::to_value(reply)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Backbone for HubAgent {
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
        if !self.rpc.is_open() {
            return Err(WeftError::ClusterDisconnected);
        }
        // replies relay up without awaiting a business answer
        let no_reply = options.no_reply || !envelope.rq;
        let inner = serde_json::to_value(&envelope)?;
        let answer = self
            .rpc
            .request(ops::FORWARD, Some(inner), SendOptions { no_reply })
            .await?;
        match answer {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None if no_reply => Ok(None),
            None => Err(WeftError::NoClusterRoute),
        }
    }

    async fn roster(&self) -> Result<Vec<String>> {
        let answer = self
            .rpc
            .request(ops::ROSTER, None, SendOptions::default())
            .await?;
        match answer {
            Some(Value::Array(ids)) => Ok(ids
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BackboneEvent> {
        self.rpc.subscribe_events()
    }
}
