//! KRPC transport: calls, their timeouts, and the socket serving them.

mod call;
mod executor;
mod scheduler;
mod server;
mod throttle;
mod timeout;

use std::net::SocketAddr;
use std::sync::Arc;

pub use call::{RpcCall, RpcCallListener, RpcState};
pub use executor::SerializedExecutor;
pub use scheduler::{Scheduler, TimerHandle};
pub use server::{MessageHandler, RpcServer, DEFAULT_PORT, VERSION};
pub use throttle::SpamThrottle;
pub use timeout::ResponseTimeoutFilter;

use crate::common::Message;

#[derive(Debug, Clone)]
/// A decoded message and where it came from.
pub struct InboundMessage {
    pub message: Message,
    pub from: SocketAddr,
    /// The call this message answers, for responses and errors matching one.
    pub call: Option<Arc<RpcCall>>,
}
