//! Dht node.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    common::{
        Contact, FindNodeRequestArguments, Id, Message, MessageType, RequestSpecific,
        RequestTypeSpecific,
    },
    config::{Config, DhtBuilder},
    routing::{snapshot::Snapshot, Node, RoutingTable},
    rpc::{
        InboundMessage, MessageHandler, RpcCall, RpcCallListener, RpcServer, RpcState, Scheduler,
        TimerHandle,
    },
    server::{DefaultServer, Server},
    Error, Result,
};

const THROTTLE_DECAY_INTERVAL: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
/// A Kademlia node on the mainline network.
///
/// Cheap to clone, every clone drives the same node. The node shuts down
/// when [Dht::shutdown] is called or the last clone is dropped.
pub struct Dht {
    inner: Arc<DhtInner>,
}

#[derive(Debug)]
struct DhtInner {
    node: Arc<Node>,
    rpc: Arc<RpcServer>,
    scheduler: Scheduler,
    bootstrap: Vec<String>,
    storage_path: Option<PathBuf>,
    timers: Mutex<Vec<TimerHandle>>,
    /// A bootstrap thread is resolving hostnames.
    resolving: Arc<AtomicBool>,
    shutdown: AtomicBool,
}

impl Dht {
    /// Bind the socket, restore the routing table if a snapshot exists and
    /// start bootstrapping in the background.
    pub fn new(mut config: Config) -> Result<Dht> {
        let snapshot = match &config.storage_path {
            Some(path) => Snapshot::load(path).unwrap_or_else(|error| {
                warn!(?path, ?error, "Ignoring unreadable routing table snapshot");
                None
            }),
            None => None,
        };

        let id = match &snapshot {
            Some(snapshot) if config.persist_id => snapshot.old_key,
            _ => config.id.unwrap_or_else(Id::random),
        };

        let node = Arc::new(Node::new(id));
        if let Some(snapshot) = snapshot {
            snapshot.restore(&node);
        }

        let server = config
            .server
            .take()
            .unwrap_or_else(|| Box::new(DefaultServer::default()));

        let handler = Arc::new(DhtHandler {
            node: node.clone(),
            server: Mutex::new(server),
            read_only: config.read_only,
        });

        let scheduler = Scheduler::new()?;

        let rpc = match RpcServer::bind(&config, scheduler.clone(), handler) {
            Ok(rpc) => rpc,
            Err(error) => {
                scheduler.shutdown();
                return Err(error);
            }
        };

        info!(%id, local_addr = ?rpc.local_addr(), "Dht started");

        let inner = Arc::new(DhtInner {
            node,
            rpc,
            scheduler,
            bootstrap: config.bootstrap,
            storage_path: config.storage_path,
            timers: Mutex::new(vec![]),
            resolving: Arc::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        });

        DhtInner::start_timers(
            &inner,
            config.bucket_check_interval,
            config.save_interval,
        );

        inner.bootstrap();

        Ok(Dht { inner })
    }

    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        *self.inner.node.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.rpc.local_addr()
    }

    /// Snapshot of the current routing table.
    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.inner.node.table()
    }

    /// The routing table owner.
    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    pub fn rpc(&self) -> &Arc<RpcServer> {
        &self.inner.rpc
    }

    /// Log2 of the estimated number of nodes in the network.
    pub fn log2_size_estimate(&self) -> f64 {
        self.inner.node.log2_size_estimate()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Ping `address`, blocking until it answers or the call times out.
    ///
    /// Returns the id the remote node answered with.
    pub fn ping(&self, address: SocketAddr) -> Result<Id> {
        let response = self.call(address, RequestTypeSpecific::Ping, None)?;

        response
            .author_id()
            .ok_or(Error::Static("Response without an id"))
    }

    /// Ask `address` for the nodes it knows closest to `target`, blocking
    /// until it answers or the call times out.
    pub fn find_node(&self, address: SocketAddr, target: Id) -> Result<Vec<Contact>> {
        let response = self.call(
            address,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            None,
        )?;

        Ok(response.closer_nodes())
    }

    /// Contact the bootstrap nodes and the closest known nodes, and ping
    /// whatever they return.
    ///
    /// Returns immediately, the table fills in the background.
    pub fn bootstrap(&self) {
        self.inner.bootstrap()
    }

    /// Persist the routing table to the configured storage path.
    pub fn save_table(&self) -> Result<()> {
        self.inner.save_table()
    }

    /// Stop every timer, time out pending calls, save the routing table
    /// and close the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown()
    }

    // === Private Methods ===

    fn call(
        &self,
        address: SocketAddr,
        request_type: RequestTypeSpecific,
        expected_id: Option<Id>,
    ) -> Result<Message> {
        let (sender, receiver) = flume::bounded(1);

        let call = self.inner.new_call(address, request_type, expected_id);
        call.add_listener(Arc::new(ResultListener { sender }));

        self.inner.rpc.do_call(call)?;

        receiver.recv().map_err(|_| Error::Shutdown)?
    }
}

impl DhtInner {
    fn start_timers(inner: &Arc<DhtInner>, bucket_check_interval: Duration, save_interval: Duration) {
        let mut timers = lock(&inner.timers);

        let weak = Arc::downgrade(inner);
        timers.push(inner.scheduler.schedule_repeating(
            bucket_check_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.maintenance();
                }
            },
        ));

        let weak = Arc::downgrade(inner);
        timers.push(inner.scheduler.schedule_repeating(
            THROTTLE_DECAY_INTERVAL,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.node.decay_throttle();
                    inner.rpc.decay_throttles();
                }
            },
        ));

        if inner.storage_path.is_some() {
            let weak: Weak<DhtInner> = Arc::downgrade(inner);
            timers.push(inner.scheduler.schedule_repeating(save_interval, move || {
                if let Some(inner) = weak.upgrade() {
                    if let Err(error) = inner.save_table() {
                        warn!(?error, "Failed to save the routing table");
                    }
                }
            }));
        }
    }

    fn new_call(
        &self,
        address: SocketAddr,
        request_type: RequestTypeSpecific,
        expected_id: Option<Id>,
    ) -> Arc<RpcCall> {
        let request = Message {
            transaction_id: vec![],
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: *self.node.id(),
                request_type,
            }),
        };

        let call = Arc::new(RpcCall::new(request, address, expected_id));
        call.add_listener(Arc::new(RoutingListener {
            node: self.node.clone(),
        }));

        call
    }

    /// Ask the known nodes closest to our id, then the bootstrap hosts once a
    /// dedicated thread has resolved them.
    fn bootstrap(self: &Arc<Self>) {
        let known = self.node.closest(self.node.id(), crate::common::MAX_BUCKET_SIZE_K);

        debug!(known = known.len(), hosts = self.bootstrap.len(), "Bootstrapping");

        for contact in known.nodes() {
            self.fill_from(contact.address, *self.node.id(), Some(contact.id));
        }

        if self.bootstrap.is_empty() || self.resolving.swap(true, Ordering::AcqRel) {
            return;
        }

        let hosts = self.bootstrap.clone();
        let ipv4 = self.rpc.local_addr().is_ipv4();
        let resolving = self.resolving.clone();
        let weak = Arc::downgrade(self);

        let spawned = thread::Builder::new()
            .name("krpc-bootstrap".to_string())
            .spawn(move || {
                let addresses = resolve(&hosts, ipv4);
                resolving.store(false, Ordering::Release);

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }

                debug!(resolved = addresses.len(), "Resolved bootstrap nodes");

                for address in addresses {
                    inner.fill_from(address, *inner.node.id(), None);
                }
            });

        if let Err(error) = spawned {
            warn!(?error, "Failed to spawn the bootstrap thread");
            self.resolving.store(false, Ordering::Release);
        }
    }

    /// Send a `find_node` for `target` to `address` and ping the contacts it returns.
    fn fill_from(&self, address: SocketAddr, target: Id, expected_id: Option<Id>) {
        let call = self.new_call(
            address,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            expected_id,
        );

        call.add_listener(Arc::new(FillListener {
            node: self.node.clone(),
            rpc: Arc::downgrade(&self.rpc),
        }));

        if let Err(error) = self.rpc.do_call(call) {
            debug!(?error, ?address, "Failed to send find_node");
        }
    }

    fn maintenance(self: &Arc<Self>) {
        let decisions = self.node.bucket_maintenance();

        for contact in decisions.nodes_to_ping {
            ping_async(&self.node, &self.rpc, contact.address, Some(contact.id));
        }

        for (contact, target) in decisions.refresh_lookups {
            self.fill_from(contact.address, target, Some(contact.id));
        }

        if decisions.should_bootstrap {
            self.bootstrap();
        }
    }

    fn save_table(&self) -> Result<()> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        Snapshot::capture(&self.node).save(path)?;
        debug!(?path, "Saved routing table");

        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        for timer in lock(&self.timers).drain(..) {
            timer.cancel();
        }

        self.rpc.shutdown();

        if let Err(error) = self.save_table() {
            warn!(?error, "Failed to save the routing table");
        }

        self.scheduler.shutdown();

        info!(id = %self.node.id(), "Dht shut down");
    }
}

/// Blocking lookup of every `host:port`, keeping the family we are bound to.
fn resolve(hosts: &[String], ipv4: bool) -> Vec<SocketAddr> {
    hosts
        .iter()
        .filter_map(|host| match host.to_socket_addrs() {
            Ok(addresses) => Some(addresses),
            Err(error) => {
                debug!(%host, ?error, "Failed to resolve bootstrap node");
                None
            }
        })
        .flatten()
        .filter(|address| address.is_ipv4() == ipv4)
        .collect()
}

impl Drop for DhtInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ping_async(node: &Arc<Node>, rpc: &RpcServer, address: SocketAddr, expected_id: Option<Id>) {
    let request = Message {
        transaction_id: vec![],
        version: None,
        requester_ip: None,
        read_only: false,
        message_type: MessageType::Request(RequestSpecific {
            requester_id: *node.id(),
            request_type: RequestTypeSpecific::Ping,
        }),
    };

    let call = Arc::new(RpcCall::new(request, address, expected_id));
    call.add_listener(Arc::new(RoutingListener { node: node.clone() }));

    if let Err(error) = rpc.do_call(call) {
        debug!(?error, ?address, "Failed to send ping");
    }
}

/// Answers requests and feeds every accepted message to the [Node].
struct DhtHandler {
    node: Arc<Node>,
    server: Mutex<Box<dyn Server>>,
    read_only: bool,
}

impl MessageHandler for DhtHandler {
    fn handle(&self, rpc: &Arc<RpcServer>, inbound: InboundMessage) {
        if let MessageType::Request(request) = &inbound.message.message_type {
            if !self.read_only {
                let table = self.node.table();
                let response = lock(&self.server).handle_request(
                    self.node.id(),
                    &table,
                    inbound.from,
                    request.clone(),
                );

                rpc.reply(&inbound.message, inbound.from, response);
            }
        }

        self.node.received(inbound);

        for contact in self.node.take_pending_pings() {
            ping_async(&self.node, rpc, contact.address, Some(contact.id));
        }
    }
}

/// Reports sends and timeouts of a call to the routing table.
struct RoutingListener {
    node: Arc<Node>,
}

impl RpcCallListener for RoutingListener {
    fn on_response(&self, _call: &RpcCall, _response: &Message) {}

    fn on_timeout(&self, call: &RpcCall) {
        self.node.on_timeout(call);
    }

    fn state_transition(&self, call: &RpcCall, previous: RpcState, current: RpcState) {
        if previous == RpcState::Unsent && current == RpcState::Sent {
            self.node.on_send(call.destination(), call.expected_id());
        }
    }
}

/// Pings the unknown contacts returned by a `find_node`.
struct FillListener {
    node: Arc<Node>,
    rpc: Weak<RpcServer>,
}

impl RpcCallListener for FillListener {
    fn on_response(&self, _call: &RpcCall, response: &Message) {
        let Some(rpc) = self.rpc.upgrade() else {
            return;
        };

        let table = self.node.table();

        for contact in response.closer_nodes() {
            if self.node.is_local_id(&contact.id) || contact.address.port() == 0 {
                continue;
            }

            let known = table
                .entry_for_id(&contact.id)
                .bucket
                .find_by_ip_or_id(contact.address.ip(), &contact.id)
                .is_some();

            if !known {
                ping_async(&self.node, &rpc, contact.address, Some(contact.id));
            }
        }
    }

    fn on_timeout(&self, _call: &RpcCall) {}
}

/// Hands the outcome of a blocking call back to the caller, once the
/// routing table has seen the answer.
struct ResultListener {
    sender: flume::Sender<Result<Message>>,
}

impl RpcCallListener for ResultListener {
    fn on_response(&self, _call: &RpcCall, _response: &Message) {}

    fn on_handled(&self, _call: &RpcCall, response: &Message) {
        let result = match &response.message_type {
            MessageType::Error(error) => Err(Error::ErrorResponse {
                code: error.code,
                description: error.description.clone(),
            }),
            _ => Ok(response.clone()),
        };

        let _ = self.sender.try_send(result);
    }

    fn on_timeout(&self, _call: &RpcCall) {
        let _ = self.sender.try_send(Err(Error::Timeout));
    }
}

/// A local network of connected nodes, for tests.
#[derive(Debug)]
pub struct Testnet {
    /// Addresses of the nodes, usable as bootstrap nodes.
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Start `count` nodes on distinct loopback addresses and make every
    /// node ping every other one.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut bootstrap = vec![];

        for i in 0..count {
            let ip = Ipv4Addr::new(127, 0, (i / 250) as u8, (i % 250 + 2) as u8);

            let mut builder = Dht::builder();
            builder.port(0).bind_address(IpAddr::V4(ip));

            if bootstrap.is_empty() {
                builder.no_bootstrap();
            } else {
                builder.bootstrap(&bootstrap);
            }

            let node = builder.build()?;
            bootstrap.push(node.local_addr().to_string());
            nodes.push(node);
        }

        for a in &nodes {
            for b in &nodes {
                if a.id() != b.id() {
                    let _ = a.ping(b.local_addr());
                }
            }
        }

        Ok(Testnet { bootstrap, nodes })
    }
}
