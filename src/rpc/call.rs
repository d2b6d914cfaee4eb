//! A single outgoing request and its lifecycle.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
    },
    time::{Duration, Instant, SystemTime},
};

use rand::Rng;
use tracing::trace;

use super::{Scheduler, TimerHandle};
use crate::common::{Id, Message, TRANSACTION_ID_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcState {
    Unsent,
    Sent,
    /// No response within the expected round trip time, still waiting.
    Stalled,
    Responded,
    /// Answered with a KRPC error message.
    Error,
    Timeout,
}

impl RpcState {
    fn from_u8(value: u8) -> RpcState {
        match value {
            0 => RpcState::Unsent,
            1 => RpcState::Sent,
            2 => RpcState::Stalled,
            3 => RpcState::Responded,
            4 => RpcState::Error,
            _ => RpcState::Timeout,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcState::Responded | RpcState::Error | RpcState::Timeout
        )
    }
}

/// Observer of an [RpcCall].
///
/// Invoked synchronously, in transition order, on the thread that caused
/// the transition.
pub trait RpcCallListener: Send + Sync {
    /// The call was answered, with a response or an error message.
    fn on_response(&self, call: &RpcCall, response: &Message);

    fn on_timeout(&self, call: &RpcCall);

    fn on_stall(&self, _call: &RpcCall) {}

    fn state_transition(&self, _call: &RpcCall, _previous: RpcState, _current: RpcState) {}

    /// The answer went through the server's [MessageHandler](super::MessageHandler),
    /// after [RpcCallListener::on_response].
    fn on_handled(&self, _call: &RpcCall, _response: &Message) {}
}

#[derive(Debug, Clone, Copy)]
struct SendInfo {
    at: Instant,
    wall: SystemTime,
    timeout_max: Duration,
}

/// A request to one remote node.
///
/// Moves forward through [RpcState]s only, `Unsent → Sent → Stalled` and
/// from any of those to a terminal state. Each transition happens once and
/// is seen by every listener.
pub struct RpcCall {
    request: Message,
    destination: SocketAddr,
    expected_id: Option<Id>,

    transaction_id: OnceLock<[u8; TRANSACTION_ID_SIZE]>,
    expected_rtt: Mutex<Option<Duration>>,

    state: AtomicU8,
    /// Serializes transitions so listeners observe them in order.
    transition_lock: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn RpcCallListener>>>,

    sent: Mutex<Option<SendInfo>>,
    responded_at: Mutex<Option<Instant>>,
    response: Mutex<Option<Message>>,
    timer: Mutex<Option<TimerHandle>>,

    socket_mismatch: AtomicBool,
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("destination", &self.destination)
            .field("expected_id", &self.expected_id)
            .field("transaction_id", &self.transaction_id.get())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RpcCall {
    pub fn new(request: Message, destination: SocketAddr, expected_id: Option<Id>) -> Self {
        RpcCall {
            request,
            destination,
            expected_id,
            transaction_id: OnceLock::new(),
            expected_rtt: Mutex::new(None),
            state: AtomicU8::new(RpcState::Unsent as u8),
            transition_lock: Mutex::new(()),
            listeners: Mutex::new(vec![]),
            sent: Mutex::new(None),
            responded_at: Mutex::new(None),
            response: Mutex::new(None),
            timer: Mutex::new(None),
            socket_mismatch: AtomicBool::new(false),
        }
    }

    // === Getters ===

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// The id the destination is believed to have.
    pub fn expected_id(&self) -> Option<Id> {
        self.expected_id
    }

    pub fn state(&self) -> RpcState {
        RpcState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn transaction_id(&self) -> Option<[u8; TRANSACTION_ID_SIZE]> {
        self.transaction_id.get().copied()
    }

    pub fn expected_rtt(&self) -> Option<Duration> {
        *lock(&self.expected_rtt)
    }

    /// Wall clock time the request was handed to the socket.
    pub fn sent_at(&self) -> Option<SystemTime> {
        lock(&self.sent).map(|info| info.wall)
    }

    /// Round trip time, once answered.
    pub fn rtt(&self) -> Option<Duration> {
        let sent = (*lock(&self.sent))?;
        let responded_at = (*lock(&self.responded_at))?;

        Some(responded_at.saturating_duration_since(sent.at))
    }

    pub fn response(&self) -> Option<Message> {
        lock(&self.response).clone()
    }

    /// A response with our transaction id came from another address.
    pub fn socket_mismatch(&self) -> bool {
        self.socket_mismatch.load(Ordering::Acquire)
    }

    // === Setup ===

    /// Listeners can only be added before the call is sent.
    pub fn add_listener(&self, listener: Arc<dyn RpcCallListener>) -> bool {
        let _guard = lock(&self.transition_lock);

        if self.state() != RpcState::Unsent {
            return false;
        }

        lock(&self.listeners).push(listener);
        true
    }

    /// Time after which the call is considered stalled.
    pub fn set_expected_rtt(&self, rtt: Duration) {
        *lock(&self.expected_rtt) = Some(rtt);
    }

    pub(crate) fn set_transaction_id(&self, transaction_id: [u8; TRANSACTION_ID_SIZE]) -> bool {
        self.transaction_id.set(transaction_id).is_ok()
    }

    pub(crate) fn set_socket_mismatch(&self) {
        self.socket_mismatch.store(true, Ordering::Release);
    }

    // === Transitions ===

    /// The request is about to leave the socket: start the stall and
    /// timeout timers.
    ///
    /// Returns false if the call was already sent or is finished.
    pub(crate) fn sent(self: &Arc<Self>, scheduler: &Scheduler, timeout_max: Duration) -> bool {
        {
            let _guard = lock(&self.transition_lock);

            if self.state() != RpcState::Unsent {
                return false;
            }

            *lock(&self.sent) = Some(SendInfo {
                at: Instant::now(),
                wall: SystemTime::now(),
                timeout_max,
            });

            self.transition_locked(RpcState::Sent);
        }

        let jitter = rand::thread_rng().gen_range(0..=2_u64);
        let stall_after = (self.expected_rtt().unwrap_or(timeout_max) + Duration::from_millis(jitter))
            .saturating_sub(Duration::from_millis(1))
            .min(timeout_max);

        self.arm_timer(scheduler, stall_after);

        true
    }

    /// The request could not be sent at all.
    pub(crate) fn send_failed(&self) {
        self.cancel_timer();
        self.transition(
            &[RpcState::Unsent, RpcState::Sent, RpcState::Stalled],
            RpcState::Timeout,
        );
    }

    /// Record the response or error message answering this call.
    pub(crate) fn on_response(&self, message: Message) -> bool {
        let state = if message.is_error() {
            RpcState::Error
        } else {
            RpcState::Responded
        };

        let _guard = lock(&self.transition_lock);
        if !matches!(self.state(), RpcState::Sent | RpcState::Stalled) {
            return false;
        }

        self.cancel_timer();
        *lock(&self.responded_at) = Some(Instant::now());
        *lock(&self.response) = Some(message);

        self.transition_locked(state);
        true
    }

    /// The answer was handed to the [MessageHandler](super::MessageHandler).
    pub(crate) fn handled(&self) {
        let Some(response) = self.response() else {
            return;
        };

        let listeners = lock(&self.listeners).clone();

        for listener in &listeners {
            listener.on_handled(self, &response);
        }
    }

    /// Treat the call as stalled right away, keep waiting until the timeout.
    pub fn inject_stall(&self) {
        self.transition(&[RpcState::Sent], RpcState::Stalled);
    }

    /// Give up on the call, as if it timed out.
    pub fn cancel(&self) {
        self.cancel_timer();
        self.transition(
            &[RpcState::Unsent, RpcState::Sent, RpcState::Stalled],
            RpcState::Timeout,
        );
    }

    fn transition(&self, expected: &[RpcState], to: RpcState) -> bool {
        let _guard = lock(&self.transition_lock);

        if !expected.contains(&self.state()) {
            return false;
        }

        self.transition_locked(to);
        true
    }

    /// Must hold the transition lock.
    fn transition_locked(&self, to: RpcState) {
        let previous = self.state();
        self.state.store(to as u8, Ordering::Release);

        trace!(
            context = "rpc_call",
            destination = ?self.destination,
            ?previous,
            current = ?to,
            "Call state transition"
        );

        let listeners = lock(&self.listeners).clone();

        for listener in &listeners {
            listener.state_transition(self, previous, to);

            match to {
                RpcState::Responded | RpcState::Error => {
                    if let Some(response) = lock(&self.response).clone() {
                        listener.on_response(self, &response);
                    }
                }
                RpcState::Timeout => listener.on_timeout(self),
                RpcState::Stalled => listener.on_stall(self),
                RpcState::Unsent | RpcState::Sent => {}
            }
        }
    }

    // === Timers ===

    fn arm_timer(self: &Arc<Self>, scheduler: &Scheduler, delay: Duration) {
        let call: Weak<RpcCall> = Arc::downgrade(self);
        let timer_scheduler = scheduler.clone();

        let handle = scheduler.schedule(delay, move || {
            if let Some(call) = call.upgrade() {
                call.check_stall_or_timeout(&timer_scheduler);
            }
        });

        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
    }

    fn check_stall_or_timeout(self: &Arc<Self>, scheduler: &Scheduler) {
        let Some(sent) = *lock(&self.sent) else {
            return;
        };

        let remaining = sent.timeout_max.saturating_sub(sent.at.elapsed());

        if remaining.is_zero() {
            self.transition(&[RpcState::Sent, RpcState::Stalled], RpcState::Timeout);
            return;
        }

        match self.state() {
            RpcState::Sent => {
                if self.transition(&[RpcState::Sent], RpcState::Stalled) {
                    self.arm_timer(scheduler, remaining);
                }
            }
            RpcState::Stalled => self.arm_timer(scheduler, remaining),
            _ => {}
        }
    }

    #[cfg(test)]
    /// Pretend the call was sent and answered after `rtt`.
    pub(crate) fn mark_answered_for_tests(&self, rtt: Duration) {
        let at = Instant::now();

        *lock(&self.sent) = Some(SendInfo {
            at,
            wall: SystemTime::now(),
            timeout_max: Duration::from_secs(10),
        });
        *lock(&self.responded_at) = Some(at + rtt);
        self.state.store(RpcState::Responded as u8, Ordering::Release);
    }
}
