//! UDP socket layer correlating calls with their responses.
use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use mio::{net::UdpSocket, Events, Interest, Poll, Token, Waker};
use rand::Rng;
use tracing::{debug, error, trace, warn};

use super::{
    InboundMessage, ResponseTimeoutFilter, RpcCall, RpcCallListener, RpcState, Scheduler,
    SpamThrottle,
};
use crate::common::{
    ErrorSpecific, Message, MessageType, GENERIC_ERROR, PROTOCOL_ERROR, SERVER_ERROR,
    TRANSACTION_ID_SIZE,
};
use crate::{Config, Error, Result};

pub const VERSION: [u8; 4] = [75, 68, 0, 1]; // "KD" version 01
pub const DEFAULT_PORT: u16 = 6881;
const MTU: usize = 2048;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Receives every decoded message the [RpcServer] accepts.
pub trait MessageHandler: Send + Sync {
    /// Called on the socket thread, must not block for long.
    fn handle(&self, server: &Arc<RpcServer>, inbound: InboundMessage);
}

#[derive(Debug)]
struct Outgoing {
    bytes: Vec<u8>,
    destination: SocketAddr,
    call: Option<Arc<RpcCall>>,
}

/// Sends calls, matches responses to them by transaction id, and hands
/// everything else to a [MessageHandler].
///
/// At most `max_active_calls` calls are in flight, the rest wait in a
/// queue. Outgoing packets go through a pipeline drained by one thread at a
/// time, paced per destination ip.
pub struct RpcServer {
    me: Weak<RpcServer>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    read_only: bool,
    max_active_calls: usize,
    timeout_max: Duration,

    calls: DashMap<[u8; TRANSACTION_ID_SIZE], Arc<RpcCall>>,
    /// Slots taken in `calls`, reserved before a call is dispatched.
    active: AtomicUsize,
    call_queue: Mutex<VecDeque<Arc<RpcCall>>>,

    pipeline: Mutex<VecDeque<Outgoing>>,
    draining: AtomicBool,
    /// Writable readiness events seen so far.
    writable_events: AtomicU64,
    /// One more than the writable event count at the last `WouldBlock`, zero
    /// while the socket accepts writes.
    blocked_at: AtomicU64,

    send_throttle: SpamThrottle,
    request_throttle: SpamThrottle,
    timeout_filter: ResponseTimeoutFilter,

    scheduler: Scheduler,
    handler: Arc<dyn MessageHandler>,

    running: AtomicBool,
    waker: Waker,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .field("active_calls", &self.calls.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RpcServer {
    /// Bind the socket and start the socket thread.
    pub fn bind(
        config: &Config,
        scheduler: Scheduler,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<RpcServer>> {
        let bind_addr = config
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let std_socket = if let Some(port) = config.port {
            std::net::UdpSocket::bind(SocketAddr::from((bind_addr, port)))?
        } else {
            match std::net::UdpSocket::bind(SocketAddr::from((bind_addr, DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => std::net::UdpSocket::bind(SocketAddr::from((bind_addr, 0))),
            }?
        };

        std_socket.set_nonblocking(true)?;
        let mut socket = UdpSocket::from_std(std_socket);
        let local_addr = socket.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let server = Arc::new_cyclic(|me| RpcServer {
            me: me.clone(),
            socket,
            local_addr,
            read_only: config.read_only,
            max_active_calls: config.max_active_calls.max(1),
            timeout_max: config.request_timeout,
            calls: DashMap::new(),
            active: AtomicUsize::new(0),
            call_queue: Mutex::new(VecDeque::new()),
            pipeline: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            writable_events: AtomicU64::new(0),
            blocked_at: AtomicU64::new(0),
            send_throttle: SpamThrottle::default(),
            request_throttle: SpamThrottle::default(),
            timeout_filter: ResponseTimeoutFilter::new(
                config.request_timeout_baseline_min,
                config.request_timeout,
            ),
            scheduler,
            handler,
            running: AtomicBool::new(true),
            waker,
            poll_thread: Mutex::new(None),
        });

        let thread = thread::Builder::new()
            .name(format!("krpc-{local_addr}"))
            .spawn({
                let server = Arc::downgrade(&server);
                move || run(server, poll)
            })?;
        *lock(&server.poll_thread) = Some(thread);

        debug!(context = "rpc_server", ?local_addr, "Listening");

        Ok(server)
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Calls sent and waiting for a response.
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Calls waiting for a free slot.
    pub fn queued_calls(&self) -> usize {
        lock(&self.call_queue).len()
    }

    pub fn timeout_filter(&self) -> &ResponseTimeoutFilter {
        &self.timeout_filter
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // === Calls ===

    /// Send `call`, or queue it if too many calls are in flight.
    pub fn do_call(&self, call: Arc<RpcCall>) -> Result<()> {
        if !self.is_running() {
            call.cancel();
            return Err(Error::Shutdown);
        }

        call.add_listener(Arc::new(ServerListener {
            server: self.me.clone(),
        }));

        if self.reserve_slot() {
            self.dispatch(call);
        } else {
            lock(&self.call_queue).push_back(call);
            // A slot may have been freed before the push.
            self.do_queued_calls();
        }

        Ok(())
    }

    fn reserve_slot(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_active_calls).then_some(active + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                active.checked_sub(1)
            });
    }

    /// Register `call` under the first vacant transaction id `candidates` yields.
    fn register<F>(&self, call: &Arc<RpcCall>, mut candidates: F) -> [u8; TRANSACTION_ID_SIZE]
    where
        F: FnMut() -> [u8; TRANSACTION_ID_SIZE],
    {
        loop {
            let candidate = candidates();

            if let Entry::Vacant(entry) = self.calls.entry(candidate) {
                entry.insert(call.clone());
                return candidate;
            }

            trace!(context = "rpc_server", "Transaction id collision, retrying");
        }
    }

    /// Remove `call` from the call table, freeing its slot.
    fn forget(&self, transaction_id: &[u8; TRANSACTION_ID_SIZE], call: &RpcCall) {
        if self
            .calls
            .remove_if(transaction_id, |_, c| std::ptr::eq(c.as_ref(), call))
            .is_some()
        {
            self.release_slot();
        }
    }

    /// Needs a reserved slot.
    fn dispatch(&self, call: Arc<RpcCall>) {
        let transaction_id = self.register(&call, rand::random);

        if !call.set_transaction_id(transaction_id) || call.state().is_terminal() {
            // Cancelled while queued, or dispatched twice.
            self.forget(&transaction_id, &call);
            return;
        }

        if call.expected_rtt().is_none() {
            call.set_expected_rtt(self.timeout_filter.stall_timeout());
        }

        let mut request = call.request().clone();
        request.transaction_id = transaction_id.to_vec();
        request.version = Some(VERSION.to_vec());
        request.read_only = self.read_only;

        let bytes = match request.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(context = "socket_error", ?error, "Failed to encode request");
                call.send_failed();
                return;
            }
        };

        trace!(
            context = "socket_message_sending",
            message = ?request,
            destination = ?call.destination(),
            "Sending request"
        );

        self.enqueue(Outgoing {
            bytes,
            destination: call.destination(),
            call: Some(call),
        });
    }

    fn do_queued_calls(&self) {
        while self.is_running() {
            if !self.reserve_slot() {
                return;
            }

            let Some(call) = lock(&self.call_queue).pop_front() else {
                self.release_slot();
                return;
            };

            self.dispatch(call);
        }
    }

    fn call_finished(&self, call: &RpcCall) {
        if let Some(transaction_id) = call.transaction_id() {
            self.forget(&transaction_id, call);
        }

        self.do_queued_calls();
    }

    // === Replies ===

    /// Answer `request` from `to` with `message_type`.
    pub fn reply(&self, request: &Message, to: SocketAddr, message_type: MessageType) {
        self.send_message(
            Message {
                transaction_id: request.transaction_id.clone(),
                version: Some(VERSION.to_vec()),
                requester_ip: Some(to),
                read_only: self.read_only,
                message_type,
            },
            to,
        );
    }

    pub fn send_error(
        &self,
        to: SocketAddr,
        transaction_id: Vec<u8>,
        code: i32,
        description: impl Into<String>,
    ) {
        let mut message = Message::error(transaction_id, code, description);
        message.version = Some(VERSION.to_vec());

        self.send_message(message, to);
    }

    fn send_message(&self, message: Message, to: SocketAddr) {
        match message.to_bytes() {
            Ok(bytes) => {
                trace!(context = "socket_message_sending", ?message, ?to, "Sending message");
                self.enqueue(Outgoing {
                    bytes,
                    destination: to,
                    call: None,
                });
            }
            Err(error) => debug!(context = "socket_error", ?error, "Failed to encode message"),
        }
    }

    // === Pipeline ===

    fn enqueue(&self, outgoing: Outgoing) {
        lock(&self.pipeline).push_back(outgoing);
        self.fill_pipe();
    }

    fn can_write(&self) -> bool {
        let blocked_at = self.blocked_at.load(Ordering::Acquire);

        blocked_at == 0 || self.writable_events.load(Ordering::Acquire) >= blocked_at
    }

    /// Drain the pipeline unless another thread already is.
    fn fill_pipe(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            self.drain_pipeline();
            self.draining.store(false, Ordering::Release);

            if !self.is_running() || !self.can_write() || lock(&self.pipeline).is_empty() {
                return;
            }
        }
    }

    fn drain_pipeline(&self) {
        while self.is_running() && self.can_write() {
            let Some(outgoing) = lock(&self.pipeline).pop_front() else {
                return;
            };

            if outgoing.call.is_some() {
                let ip = outgoing.destination.ip();
                let delay = self.send_throttle.calculate_delay_and_add(ip);

                if !delay.is_zero() {
                    // Counted again when it is retried.
                    self.send_throttle.saturating_dec(ip);

                    let delay = delay + Duration::from_millis(rand::thread_rng().gen_range(10..50));
                    let server = self.me.clone();

                    trace!(context = "socket_throttle", destination = ?outgoing.destination, ?delay, "Delaying call");

                    self.scheduler.schedule(delay, move || {
                        if let Some(server) = server.upgrade() {
                            server.enqueue(outgoing);
                        }
                    });
                    continue;
                }
            }

            // Sent before it hits the socket, the response may come back
            // before `send_to` returns.
            if let Some(call) = &outgoing.call {
                if !call.sent(&self.scheduler, self.timeout_max) && call.state().is_terminal() {
                    continue;
                }
            }

            let epoch = self.writable_events.load(Ordering::Acquire);

            match self.socket.send_to(&outgoing.bytes, outgoing.destination) {
                Ok(_) => {
                    self.blocked_at.store(0, Ordering::Release);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    self.blocked_at.store(epoch + 1, Ordering::Release);
                    lock(&self.pipeline).push_front(outgoing);
                    return;
                }
                Err(error) => {
                    debug!(
                        context = "socket_error",
                        ?error,
                        destination = ?outgoing.destination,
                        "Failed to send"
                    );

                    if let Some(call) = outgoing.call {
                        call.send_failed();
                    }
                }
            }
        }
    }

    // === Receiving ===

    fn read_all(self: &Arc<Self>, buf: &mut [u8]) {
        loop {
            match self.socket.recv_from(buf) {
                Ok((amt, from)) => self.handle_packet(&buf[..amt], from),
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                // ICMP port unreachable surfaces as a reset on some platforms.
                Err(error) if error.kind() == ErrorKind::ConnectionReset => continue,
                Err(error) => {
                    warn!("IO error {error}");
                    return;
                }
            }
        }
    }

    fn handle_packet(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
        if from.port() == 0 {
            trace!(context = "socket_validation", message = "Packet from port 0");
            return;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );

                self.send_error(
                    from,
                    vec![0; TRANSACTION_ID_SIZE],
                    PROTOCOL_ERROR,
                    "invalid bencoding",
                );
                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from, "Received message");

        match &message.message_type {
            MessageType::Request(_) => {
                if self.request_throttle.add_and_test(from.ip()) {
                    trace!(context = "socket_throttle", ?from, "Dropping request over the burst");
                    return;
                }

                self.handler.handle(
                    self,
                    InboundMessage {
                        message,
                        from,
                        call: None,
                    },
                );
            }
            MessageType::Response(_) | MessageType::Error(_) => self.handle_reply(message, from),
        }
    }

    fn handle_reply(self: &Arc<Self>, message: Message, from: SocketAddr) {
        let is_response = message.is_response();

        let Ok(transaction_id) = <[u8; TRANSACTION_ID_SIZE]>::try_from(message.transaction_id.as_slice())
        else {
            if is_response {
                self.send_error(
                    from,
                    message.transaction_id.clone(),
                    SERVER_ERROR,
                    "received a response with an invalid transaction id length",
                );
            }
            return;
        };

        let call = self.calls.get(&transaction_id).map(|c| c.value().clone());

        match call {
            Some(call) if call.destination() == from => {
                // Leaves the call table through `call_finished`.
                if !call.on_response(message.clone()) {
                    trace!(context = "socket_validation", ?from, state = ?call.state(), "Late or duplicate reply");
                    return;
                }

                if let MessageType::Error(ErrorSpecific { code, description }) = &message.message_type {
                    debug!(context = "rpc_error_response", ?from, code, %description, "Error response");
                }

                self.handler.handle(
                    self,
                    InboundMessage {
                        message,
                        from,
                        call: Some(call.clone()),
                    },
                );

                call.handled();
            }
            Some(call) => {
                debug!(
                    context = "socket_validation",
                    destination = ?call.destination(),
                    ?from,
                    "Response with a matching transaction id from another address"
                );

                self.send_error(
                    call.destination(),
                    transaction_id.to_vec(),
                    GENERIC_ERROR,
                    format!(
                        "A request was sent to {} and a response with matching transaction id was received from {}. \
                         Multihomed nodes should ensure that sockets are properly bound and responses are sent with the \
                         correct source socket address.",
                        call.destination(),
                        from
                    ),
                );

                call.set_socket_mismatch();
                call.inject_stall();
            }
            None if is_response => {
                trace!(context = "socket_validation", ?from, "Unexpected response transaction id");

                self.send_error(
                    from,
                    transaction_id.to_vec(),
                    SERVER_ERROR,
                    "received a response message whose transaction ID did not match a pending request or transaction expired",
                );
            }
            None => {
                trace!(context = "socket_validation", ?from, "Error message for an unknown call");
            }
        }
    }

    // === Maintenance ===

    /// Forget expired throttle hits, meant to run about once per second.
    pub fn decay_throttles(&self) {
        self.send_throttle.decay();
        self.request_throttle.decay();
    }

    /// Stop the socket thread and time out every pending call.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let queued: Vec<_> = lock(&self.call_queue).drain(..).collect();
        let active: Vec<_> = self.calls.iter().map(|c| c.value().clone()).collect();
        self.calls.clear();
        self.active.store(0, Ordering::Release);
        lock(&self.pipeline).clear();

        for call in queued.into_iter().chain(active) {
            call.cancel();
        }

        if let Err(error) = self.waker.wake() {
            debug!(context = "rpc_server", ?error, "Failed to wake the socket thread");
        }

        let handle = lock(&self.poll_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        debug!(context = "rpc_server", local_addr = ?self.local_addr, "Shut down");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Keeps the call table and the timeout filter in sync with each call.
struct ServerListener {
    server: Weak<RpcServer>,
}

impl RpcCallListener for ServerListener {
    fn on_response(&self, call: &RpcCall, response: &Message) {
        if response.is_error() {
            return;
        }

        if let (Some(server), Some(rtt)) = (self.server.upgrade(), call.rtt()) {
            server.timeout_filter.update(rtt);
        }
    }

    fn on_timeout(&self, _call: &RpcCall) {}

    fn state_transition(&self, call: &RpcCall, _previous: RpcState, current: RpcState) {
        if !current.is_terminal() {
            return;
        }

        if let Some(server) = self.server.upgrade() {
            server.call_finished(call);
        }
    }
}

fn run(server: Weak<RpcServer>, mut poll: Poll) {
    let mut events = Events::with_capacity(128);
    let mut buf = [0_u8; MTU];

    loop {
        if let Err(error) = poll.poll(&mut events, None) {
            if error.kind() == ErrorKind::Interrupted {
                continue;
            }

            error!(context = "rpc_server", ?error, "Poll failed, stopping");
            return;
        }

        let Some(server) = server.upgrade() else {
            return;
        };

        if !server.is_running() {
            return;
        }

        for event in events.iter() {
            if event.token() != SOCKET {
                continue;
            }

            if event.is_writable() {
                server.writable_events.fetch_add(1, Ordering::AcqRel);
                server.fill_pipe();
            }

            if event.is_readable() {
                server.read_all(&mut buf);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{net::UdpSocket as StdUdpSocket, time::Instant};

    use super::*;
    use crate::common::{
        Id, PingResponseArguments, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    };

    #[derive(Default)]
    struct Collect {
        inbound: Mutex<Vec<InboundMessage>>,
    }

    impl MessageHandler for Collect {
        fn handle(&self, _server: &Arc<RpcServer>, inbound: InboundMessage) {
            lock(&self.inbound).push(inbound);
        }
    }

    fn server(handler: Arc<dyn MessageHandler>, timeout: Duration) -> Arc<RpcServer> {
        let config = Config {
            port: Some(0),
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            request_timeout: timeout,
            ..Default::default()
        };

        RpcServer::bind(&config, Scheduler::new().expect("scheduler"), handler).expect("bind")
    }

    fn peer() -> StdUdpSocket {
        let socket = StdUdpSocket::bind("127.0.0.1:0").expect("bind");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        socket
    }

    fn ping_call(to: SocketAddr) -> Arc<RpcCall> {
        let request = Message {
            transaction_id: vec![],
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            }),
        };

        Arc::new(RpcCall::new(request, to, None))
    }

    /// Answers every ping right away, until idle for half a second.
    fn responder() -> (SocketAddr, thread::JoinHandle<usize>) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").expect("bind");
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");
        let address = socket.local_addr().expect("addr");

        let handle = thread::spawn(move || {
            let mut answered = 0;
            let mut buf = [0_u8; MTU];

            while let Ok((amt, from)) = socket.recv_from(&mut buf) {
                if let Ok(request) = Message::from_bytes(&buf[..amt]) {
                    let _ = socket.send_to(&ping_response(request.transaction_id), from);
                    answered += 1;
                }
            }

            answered
        });

        (address, handle)
    }

    /// Records the number of active calls whenever a call is sent.
    struct ActiveCalls {
        server: Weak<RpcServer>,
        seen: Mutex<Vec<usize>>,
    }

    impl RpcCallListener for ActiveCalls {
        fn on_response(&self, _call: &RpcCall, _response: &Message) {}
        fn on_timeout(&self, _call: &RpcCall) {}

        fn state_transition(&self, _call: &RpcCall, _previous: RpcState, current: RpcState) {
            if current == RpcState::Sent {
                if let Some(server) = self.server.upgrade() {
                    lock(&self.seen).push(server.active_calls());
                }
            }
        }
    }

    fn recv(socket: &StdUdpSocket) -> (Message, SocketAddr) {
        let mut buf = [0_u8; MTU];
        let (amt, from) = socket.recv_from(&mut buf).expect("recv");

        (Message::from_bytes(&buf[..amt]).expect("decode"), from)
    }

    fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn ping_response(transaction_id: Vec<u8>) -> Vec<u8> {
        Message {
            transaction_id,
            version: None,
            requester_ip: None,
            read_only: false,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        }
        .to_bytes()
        .expect("encode")
    }

    #[test]
    fn call_and_response() {
        let handler = Arc::new(Collect::default());
        let server = server(handler.clone(), Duration::from_secs(2));
        let peer = peer();

        let call = ping_call(peer.local_addr().expect("addr"));
        server.do_call(call.clone()).expect("do_call");

        let (request, from) = recv(&peer);
        assert!(request.is_request());
        assert_eq!(request.transaction_id.len(), TRANSACTION_ID_SIZE);
        assert_eq!(call.transaction_id().map(|t| t.to_vec()), Some(request.transaction_id.clone()));
        assert_eq!(from, server.local_addr());

        peer.send_to(&ping_response(request.transaction_id), from)
            .expect("send");

        assert!(wait_for(Duration::from_secs(2), || call.state() == RpcState::Responded));
        assert!(call.rtt().is_some());
        assert!(wait_for(Duration::from_secs(1), || !lock(&handler.inbound).is_empty()));
        assert!(lock(&handler.inbound)[0].call.is_some());
        assert_eq!(server.active_calls(), 0);

        server.shutdown();
    }

    #[test]
    fn unknown_transaction_id_gets_server_error() {
        let server = server(Arc::new(Collect::default()), Duration::from_secs(2));
        let peer = peer();

        peer.send_to(&ping_response(vec![1; 6]), server.local_addr())
            .expect("send");

        let (error, _) = recv(&peer);
        let MessageType::Error(ErrorSpecific { code, .. }) = error.message_type else {
            panic!("expected an error");
        };
        assert_eq!(code, SERVER_ERROR);

        peer.send_to(&ping_response(vec![1; 4]), server.local_addr())
            .expect("send");
        let (error, _) = recv(&peer);
        assert!(matches!(
            error.message_type,
            MessageType::Error(ErrorSpecific { code: SERVER_ERROR, .. })
        ));

        server.shutdown();
    }

    #[test]
    fn garbage_gets_protocol_error() {
        let server = server(Arc::new(Collect::default()), Duration::from_secs(2));
        let peer = peer();

        peer.send_to(b"definitely not bencode", server.local_addr())
            .expect("send");

        let (error, _) = recv(&peer);
        assert_eq!(error.transaction_id, vec![0; TRANSACTION_ID_SIZE]);
        assert!(matches!(
            error.message_type,
            MessageType::Error(ErrorSpecific { code: PROTOCOL_ERROR, .. })
        ));

        server.shutdown();
    }

    #[test]
    fn response_from_wrong_address_stalls() {
        let handler = Arc::new(Collect::default());
        let server = server(handler.clone(), Duration::from_secs(2));
        let target = peer();
        let impostor = peer();

        let call = ping_call(target.local_addr().expect("addr"));
        server.do_call(call.clone()).expect("do_call");
        let (request, from) = recv(&target);

        impostor
            .send_to(&ping_response(request.transaction_id.clone()), from)
            .expect("send");

        // The original destination is told about the mismatch.
        let (error, _) = recv(&target);
        assert!(matches!(
            error.message_type,
            MessageType::Error(ErrorSpecific { code: GENERIC_ERROR, .. })
        ));

        assert!(wait_for(Duration::from_secs(1), || call.state() == RpcState::Stalled));
        assert!(call.socket_mismatch());
        assert!(lock(&handler.inbound).is_empty());

        server.shutdown();
    }

    #[test]
    fn unanswered_call_times_out() {
        let server = server(Arc::new(Collect::default()), Duration::from_millis(300));
        let peer = peer();

        let call = ping_call(peer.local_addr().expect("addr"));
        server.do_call(call.clone()).expect("do_call");

        assert!(wait_for(Duration::from_secs(2), || call.state() == RpcState::Timeout));
        assert!(wait_for(Duration::from_secs(1), || server.active_calls() == 0));

        server.shutdown();
    }

    #[test]
    fn calls_over_capacity_are_queued() {
        let config = Config {
            port: Some(0),
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            max_active_calls: 2,
            request_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let server = RpcServer::bind(
            &config,
            Scheduler::new().expect("scheduler"),
            Arc::new(Collect::default()),
        )
        .expect("bind");

        let peer = peer();
        let calls: Vec<_> = (0..5)
            .map(|_| ping_call(peer.local_addr().expect("addr")))
            .collect();

        for call in &calls {
            server.do_call(call.clone()).expect("do_call");
        }

        assert!(server.active_calls() <= 2);
        assert_eq!(server.queued_calls(), 3);

        assert!(wait_for(Duration::from_secs(5), || calls
            .iter()
            .all(|c| c.state() == RpcState::Timeout)));
        assert_eq!(server.queued_calls(), 0);

        server.shutdown();
    }

    #[test]
    fn shutdown_cancels_pending_calls() {
        let server = server(Arc::new(Collect::default()), Duration::from_secs(10));
        let peer = peer();

        let call = ping_call(peer.local_addr().expect("addr"));
        server.do_call(call.clone()).expect("do_call");
        server.shutdown();

        assert_eq!(call.state(), RpcState::Timeout);
        assert!(!server.is_running());

        let late = ping_call(peer.local_addr().expect("addr"));
        assert!(matches!(server.do_call(late.clone()), Err(Error::Shutdown)));
        assert_eq!(late.state(), RpcState::Timeout);
    }

    #[test]
    fn instant_responses_are_never_lost() {
        let server = server(Arc::new(Collect::default()), Duration::from_secs(2));
        let (address, responder) = responder();

        for _ in 0..40 {
            // Stay under the per ip burst, pacing is not what this is about.
            server.send_throttle.clear();

            let calls: Vec<_> = (0..10).map(|_| ping_call(address)).collect();
            for call in &calls {
                server.do_call(call.clone()).expect("do_call");
            }

            assert!(wait_for(Duration::from_secs(2), || calls
                .iter()
                .all(|c| c.state().is_terminal())));

            for call in &calls {
                assert_eq!(call.state(), RpcState::Responded, "{call:?}");
                assert!(call.rtt().is_some());
            }
        }

        assert!(wait_for(Duration::from_secs(1), || server.active_calls() == 0));
        server.shutdown();
        assert_eq!(responder.join().expect("responder"), 400);
    }

    #[test]
    fn pending_calls_have_distinct_transaction_ids() {
        let config = Config {
            port: Some(0),
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            max_active_calls: 2000,
            request_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let server = RpcServer::bind(
            &config,
            Scheduler::new().expect("scheduler"),
            Arc::new(Collect::default()),
        )
        .expect("bind");
        let silent = peer();

        let calls: Vec<_> = (0..1000)
            .map(|_| ping_call(silent.local_addr().expect("addr")))
            .collect();
        for call in &calls {
            server.do_call(call.clone()).expect("do_call");
        }

        let ids: std::collections::HashSet<_> =
            calls.iter().filter_map(|c| c.transaction_id()).collect();
        assert_eq!(ids.len(), calls.len());
        assert_eq!(server.calls.len(), calls.len());
        assert_eq!(server.active_calls(), calls.len());

        for call in &calls {
            let id = call.transaction_id().expect("dispatched");
            let registered = server.calls.get(&id).map(|c| c.value().clone());
            assert!(registered.is_some_and(|c| Arc::ptr_eq(&c, call)));
        }

        server.shutdown();
    }

    #[test]
    fn transaction_id_collision_retries() {
        let server = server(Arc::new(Collect::default()), Duration::from_secs(2));
        let silent = peer();
        let first = ping_call(silent.local_addr().expect("addr"));
        let second = ping_call(silent.local_addr().expect("addr"));

        assert_eq!(server.register(&first, || [1; 6]), [1; 6]);

        let mut candidates = vec![[2; 6], [1; 6], [1; 6]];
        assert_eq!(server.register(&second, || candidates.pop().expect("candidate")), [2; 6]);
        assert!(candidates.is_empty());

        let registered = server.calls.get(&[1; 6]).map(|c| c.value().clone());
        assert!(registered.is_some_and(|c| Arc::ptr_eq(&c, &first)));

        server.shutdown();
    }

    #[test]
    fn concurrent_callers_respect_the_cap() {
        let config = Config {
            port: Some(0),
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            max_active_calls: 4,
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let server = RpcServer::bind(
            &config,
            Scheduler::new().expect("scheduler"),
            Arc::new(Collect::default()),
        )
        .expect("bind");
        let (address, responder) = responder();
        let observer = Arc::new(ActiveCalls {
            server: Arc::downgrade(&server),
            seen: Mutex::new(vec![]),
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                let observer = observer.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| {
                            server.send_throttle.clear();

                            let call = ping_call(address);
                            call.add_listener(observer.clone());
                            server.do_call(call.clone()).expect("do_call");
                            call
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let calls: Vec<_> = threads
            .into_iter()
            .flat_map(|t| t.join().expect("thread panicked"))
            .collect();

        // No call is stranded in the queue.
        assert!(wait_for(Duration::from_secs(10), || calls
            .iter()
            .all(|c| c.state() == RpcState::Responded)));
        assert_eq!(server.queued_calls(), 0);

        let seen = lock(&observer.seen).clone();
        assert_eq!(seen.len(), calls.len());
        assert!(seen.iter().all(|active| *active <= 4), "{seen:?}");

        server.shutdown();
        let _ = responder.join();
    }

    #[test]
    fn handler_sees_the_answer_before_on_handled() {
        struct SeenByHandler {
            handler: Arc<Collect>,
            seen: Mutex<Option<usize>>,
        }

        impl RpcCallListener for SeenByHandler {
            fn on_response(&self, _call: &RpcCall, _response: &Message) {}
            fn on_timeout(&self, _call: &RpcCall) {}

            fn on_handled(&self, _call: &RpcCall, _response: &Message) {
                *lock(&self.seen) = Some(lock(&self.handler.inbound).len());
            }
        }

        let handler = Arc::new(Collect::default());
        let server = server(handler.clone(), Duration::from_secs(2));
        let (address, responder) = responder();

        let listener = Arc::new(SeenByHandler {
            handler: handler.clone(),
            seen: Mutex::new(None),
        });
        let call = ping_call(address);
        call.add_listener(listener.clone());
        server.do_call(call).expect("do_call");

        assert!(wait_for(Duration::from_secs(2), || lock(&listener.seen).is_some()));
        assert_eq!(*lock(&listener.seen), Some(1));

        server.shutdown();
        let _ = responder.join();
    }
}
