//! # Cluster Node
//!
//! One server process's view of the cluster. The node owns the router, the
//! reference registry, the codec and the handler table; nothing is global,
//! so several nodes can share one process (which is how the tests build
//! multi-server topologies).
//!
//! ## Lifecycle
//!
//! 1. `NodeBuilder::build` wires the components and starts the sweep tasks.
//! 2. `connect` / `accept` authenticate a transport and attach it as a link.
//!    Each link gets a writer task and a reader pump feeding the dispatcher.
//! 3. `shutdown` stops the sweeps, fails everything pending and closes links.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use meshpack::Frame;
use meshrpc::AuthRequest;
use meshrpc::AuthResponse;
use meshrpc::Codec;
use meshrpc::ForwardEnvelope;
use meshrpc::ForwardKind;
use meshrpc::Message;
use meshrpc::MessageType;
use meshrpc::MultiForward;
use meshrpc::Route;
use meshrpc::decode_frame;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::callback::CallError;
use crate::callback::Reply;
use crate::callback::into_result;
use crate::config::ClusterConfig;
use crate::connection;
use crate::connection::Connection;
use crate::connection::Link;
use crate::connection::PeerConnection;
use crate::connection::recv_frame;
use crate::dispatch::Dispatcher;
use crate::dispatch::HandlerTable;
use crate::entity::EntityRef;
use crate::finder::AddressFinder;
use crate::finder::LocalEntities;
use crate::finder::LocalEntityFinder;
use crate::identity::EntityAddress;
use crate::identity::ServerIdentity;
use crate::mailbox::MessageHandler;
use crate::registry::Registry;
use crate::router::Hop;
use crate::router::Router;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug)]
pub enum Error {
    Transport(transport::Error),
    Rpc(meshrpc::Error),
    Connection(connection::Error),
    /// The peer did not finish the handshake in time.
    HandshakeTimeout,
    /// The peer closed the transport during the handshake.
    HandshakeClosed,
    /// No direct or relayed link reaches the server.
    Unreachable { server_type: i32, server_id: i32 },
    ShutDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Rpc(e) => write!(f, "Message error: {}", e),
            Self::Connection(e) => write!(f, "Connection error: {}", e),
            Self::HandshakeTimeout => write!(f, "Handshake timed out"),
            Self::HandshakeClosed => write!(f, "Peer closed during handshake"),
            Self::Unreachable { server_type, server_id } => {
                write!(f, "Server {}/{} is unreachable", server_type, server_id)
            }
            Self::ShutDown => write!(f, "Node is shut down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<meshrpc::Error> for Error {
    fn from(e: meshrpc::Error) -> Self {
        Self::Rpc(e)
    }
}

impl From<connection::Error> for Error {
    fn from(e: connection::Error) -> Self {
        Self::Connection(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fluent builder for a `ClusterNode`.
pub struct NodeBuilder {
    identity: ServerIdentity,
    config: ClusterConfig,
    codec: Codec,
    address_finder: Option<Arc<dyn AddressFinder>>,
    local_finder: Option<Arc<dyn LocalEntityFinder>>,
    handlers: HandlerTable,
}

impl NodeBuilder {
    pub fn new(identity: ServerIdentity) -> Self {
        Self {
            identity,
            config: ClusterConfig::default(),
            codec: Codec::new(),
            address_finder: None,
            local_finder: None,
            handlers: HandlerTable::new(),
        }
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Makes `M` decodable by this node.
    pub fn register<M: MessageType>(mut self) -> Self {
        self.codec.register::<M>();
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn address_finder(mut self, finder: impl AddressFinder) -> Self {
        self.address_finder = Some(Arc::new(finder));
        self
    }

    /// Replaces the built-in `LocalEntities` manager.
    pub fn local_finder(mut self, finder: Arc<dyn LocalEntityFinder>) -> Self {
        self.local_finder = Some(finder);
        self
    }

    /// Handles messages with id `msg_id` that are addressed to this server.
    pub fn handler(self, msg_id: i32, handler: impl MessageHandler) -> Self {
        self.handlers.register(msg_id, Arc::new(handler));
        self
    }

    /// Handles addressed messages that have no dedicated handler.
    pub fn fallback_handler(mut self, handler: impl MessageHandler) -> Self {
        self.handlers.set_fallback(Arc::new(handler));
        self
    }

    /// Builds the node and starts its sweep tasks. Must run inside a tokio runtime.
    pub fn build(self) -> Arc<ClusterNode> {
        let address_finder: Arc<dyn AddressFinder> = match self.address_finder {
            Some(finder) => finder,
            None => Arc::new(|_: i32, _: i64| -> Option<EntityAddress> { None }),
        };

        let (entities, local_finder) = match self.local_finder {
            Some(finder) => (None, finder),
            None => {
                let entities = Arc::new(LocalEntities::new(
                    self.identity.address(),
                    address_finder.clone(),
                    &self.config,
                ));
                let finder: Arc<dyn LocalEntityFinder> = entities.clone();
                (Some(entities), finder)
            }
        };

        let codec = Arc::new(self.codec);
        let router = Arc::new(Router::new(
            self.identity.clone(),
            self.config.cross_connect_types.clone(),
        ));
        let registry = Arc::new(Registry::new(
            router.clone(),
            local_finder,
            address_finder,
            codec.clone(),
            &self.config,
        ));
        let dispatcher = Arc::new(Dispatcher {
            router: router.clone(),
            registry: registry.clone(),
            codec,
            handlers: Arc::new(self.handlers),
            rpc_timeout: self.config.rpc_timeout,
            not_exists_code: self.config.not_exists_code,
        });

        let sweepers = vec![
            registry.spawn_sweeper(self.config.registry_sweep_interval),
            spawn_link_sweeper(&router, self.config.addon_sweep_interval),
        ];

        info!(node = %self.identity, "node started");
        Arc::new(ClusterNode {
            identity: self.identity,
            config: self.config,
            router,
            registry,
            dispatcher,
            entities,
            sweepers: Mutex::new(sweepers),
            shut_down: AtomicBool::new(false),
        })
    }
}

fn spawn_link_sweeper(router: &Arc<Router>, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(router);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(router) = weak.upgrade() else { break };
            let now = Instant::now();
            for link in router.links() {
                link.rpc.check_expired(now);
            }
        }
    })
}

pub struct ClusterNode {
    identity: ServerIdentity,
    config: ClusterConfig,
    router: Arc<Router>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    entities: Option<Arc<LocalEntities>>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ClusterNode {
    pub fn builder(identity: ServerIdentity) -> NodeBuilder {
        NodeBuilder::new(identity)
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The built-in entity manager, unless a custom finder replaced it.
    pub fn entities(&self) -> Option<&Arc<LocalEntities>> {
        self.entities.as_ref()
    }

    /// Registers or replaces a handler at runtime.
    pub fn register_handler(&self, msg_id: i32, handler: impl MessageHandler) {
        self.dispatcher.handlers.register(msg_id, Arc::new(handler));
    }

    /// Authenticates as the calling side and attaches the link.
    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Arc<Link>> {
        self.ensure_running()?;
        let req = (&self.identity.auth_request() as &dyn Message).to_frame(1)?;
        transport.send(&req.encode().map_err(meshrpc::Error::from)?).await?;

        let frame = self.handshake_frame(transport.as_ref()).await?;
        let resp = decode_frame::<AuthResponse>(&frame)?;
        let peer = ServerIdentity::from(resp);
        debug!(node = %self.identity, peer = %peer, "connected");
        Ok(self.attach(peer, transport))
    }

    /// Authenticates as the accepting side and attaches the link.
    pub async fn accept(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Arc<Link>> {
        self.ensure_running()?;
        let frame = self.handshake_frame(transport.as_ref()).await?;
        let req = decode_frame::<AuthRequest>(&frame)?;
        let peer = ServerIdentity::from(req);

        let resp = (&self.identity.auth_response() as &dyn Message).to_frame(-frame.seq)?;
        transport.send(&resp.encode().map_err(meshrpc::Error::from)?).await?;
        debug!(node = %self.identity, peer = %peer, "accepted");
        Ok(self.attach(peer, transport))
    }

    async fn handshake_frame(&self, transport: &dyn Transport) -> Result<Frame> {
        match tokio::time::timeout(self.config.handshake_timeout, recv_frame(transport)).await {
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(Error::HandshakeClosed),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::HandshakeTimeout),
        }
    }

    /// Wraps an authenticated transport, registers the link and starts its
    /// reader pump. When the pump ends the link is removed and its pending
    /// calls fail with `ConnectionLost`.
    fn attach(self: &Arc<Self>, peer: ServerIdentity, transport: Arc<dyn Transport>) -> Arc<Link> {
        let conn = PeerConnection::spawn(peer, transport, self.config.max_frame);
        let link = self.add_link(conn.clone());

        let dispatcher = self.dispatcher.clone();
        let router = self.router.clone();
        let pump_link = link.clone();
        tokio::spawn(async move {
            loop {
                match conn.recv_frame().await {
                    Ok(Some(frame)) => dispatcher.on_frame(&pump_link, frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %pump_link.peer(), error = %e, "read failed");
                        break;
                    }
                }
            }
            conn.close();
            router.remove(&pump_link);
            let failed = pump_link.rpc.fail_all(CallError::ConnectionLost);
            debug!(peer = %pump_link.peer(), failed, "link closed");
        });

        link
    }

    /// Registers a link over an existing connection. No reader is started;
    /// inbound frames must be fed through `handle_frame`.
    pub fn add_link(&self, conn: Arc<dyn Connection>) -> Arc<Link> {
        let link = Arc::new(Link::new(conn, &self.identity));
        if let Some(old) = self.router.add(link.clone()) {
            old.conn.close();
            old.rpc.fail_all(CallError::ConnectionLost);
        }
        link
    }

    /// Dispatches one inbound frame as if read from `from`.
    pub fn handle_frame(&self, from: &Arc<Link>, frame: Frame) {
        self.dispatcher.on_frame(from, frame);
    }

    /// The reference for an entity, wherever it lives.
    pub fn get_ref(&self, entity_type: i32, entity_id: i64) -> EntityRef {
        self.registry.get_ref(entity_type, entity_id)
    }

    /// One-way send to a server, directly or through a relay.
    pub fn forward(&self, dst_type: i32, dst_id: i32, msg: &dyn Message) -> Result<()> {
        self.ensure_running()?;
        if self.router.is_local(dst_type, dst_id) {
            if let Err(err) = self.dispatcher.deliver_decoded(self.loopback(msg)?) {
                debug!(error = %err, "local forward not handled");
            }
            return Ok(());
        }
        match self.router.route(dst_type, dst_id) {
            Some(Hop::Direct(link)) => Ok(link.conn.send_message(msg, 0)?),
            Some(Hop::Relay(link)) => {
                let env = ForwardEnvelope::wrap(ForwardKind::Oneway, self.route_to(dst_type, dst_id), 0, msg)?;
                Ok(link.conn.send_message(&env, 0)?)
            }
            None => Err(Error::Unreachable {
                server_type: dst_type,
                server_id: dst_id,
            }),
        }
    }

    /// One-way send to many servers of one type. Direct links get the plain
    /// message; each relay gets one multi-forward for the ids behind it.
    /// Returns how many destinations were handed off.
    pub fn multi_forward(&self, dst_type: i32, dst_ids: &[i32], msg: &dyn Message) -> Result<usize> {
        self.ensure_running()?;
        let mut seen: Vec<i32> = Vec::with_capacity(dst_ids.len());
        let mut relayed: HashMap<(i32, i32), (Arc<Link>, Vec<i32>)> = HashMap::new();
        let mut handed_off = 0;

        for id in dst_ids {
            if seen.contains(id) || self.router.is_local(dst_type, *id) {
                continue;
            }
            seen.push(*id);
            match self.router.route(dst_type, *id) {
                Some(Hop::Direct(link)) => {
                    if link.conn.send_message(msg, 0).is_ok() {
                        handed_off += 1;
                    }
                }
                Some(Hop::Relay(link)) => {
                    relayed
                        .entry((link.peer().server_type, link.peer().server_id))
                        .or_insert_with(|| (link.clone(), Vec::new()))
                        .1
                        .push(*id);
                }
                None => debug!(dst_type, dst_id = *id, "multi-forward destination unreachable"),
            }
        }

        for (_, (link, ids)) in relayed {
            let count = ids.len();
            let multi = MultiForward::wrap(self.identity.server_type, self.identity.server_id, dst_type, ids, msg)?;
            match link.conn.send_message(&multi, 0) {
                Ok(()) => handed_off += count,
                Err(e) => debug!(peer = %link.peer(), error = %e, "multi-forward not sent"),
            }
        }
        Ok(handed_off)
    }

    /// Request to a server: a plain `ask` over a direct link, or a
    /// `forward_ask` through a relay.
    pub fn ask_server(&self, dst_type: i32, dst_id: i32, msg: &dyn Message, timeout: Duration) -> Reply {
        if self.shut_down.load(Ordering::Acquire) {
            return Reply::ready(Err(CallError::Shutdown));
        }
        if self.router.is_local(dst_type, dst_id) {
            let result = self
                .loopback(msg)
                .map_err(|_| CallError::Encode)
                .and_then(|msg| self.dispatcher.deliver_decoded(msg))
                .and_then(into_result);
            return Reply::ready(result);
        }
        match self.router.route(dst_type, dst_id) {
            Some(Hop::Direct(link)) => link.rpc.ask(msg, timeout),
            Some(Hop::Relay(link)) => link.rpc.forward_ask(dst_type, dst_id, msg, timeout),
            None => Reply::ready(Err(CallError::Unreachable)),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the sweeps, fails every pending call on every ref and link with
    /// `Shutdown`, and closes all links.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let sweepers = match self.sweepers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in sweepers {
            task.abort();
        }

        let refs_failed = self.registry.shutdown();
        let mut links_failed = 0;
        for link in self.router.links() {
            links_failed += link.rpc.fail_all(CallError::Shutdown);
            link.conn.close();
            self.router.remove(&link);
        }
        info!(node = %self.identity, refs_failed, links_failed, "node shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    fn route_to(&self, dst_type: i32, dst_id: i32) -> Route {
        Route::new(self.identity.server_type, self.identity.server_id, dst_type, dst_id)
    }

    /// Round-trips a message through the codec so local delivery sees the
    /// same owned value a remote one would.
    fn loopback(&self, msg: &dyn Message) -> Result<meshrpc::BoxMessage> {
        Ok(self.dispatcher.codec.decode(msg.msg_id(), &msg.to_bytes()?)?)
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        if let Ok(mut sweepers) = self.sweepers.lock() {
            for task in sweepers.drain(..) {
                task.abort();
            }
        }
    }
}
