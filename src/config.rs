use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::common::Id;
use crate::server::Server;
use crate::Dht;

/// Bootstrap nodes of the public mainline network.
pub const DEFAULT_BOOTSTRAP_NODES: [&str; 3] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
];

/// Hard timeout of a call, also the stall timeout until enough round trip
/// times were observed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Lower bound of the adaptive stall timeout.
pub const DEFAULT_TIMEOUT_BASELINE_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_ACTIVE_CALLS: usize = 256;
pub const DEFAULT_BUCKET_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port`.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES]
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying `6881` first and falling back to a random port.
    pub port: Option<u16>,
    /// Address to bind the socket to.
    ///
    /// Defaults to None, the unspecified IPv4 address.
    pub bind_address: Option<IpAddr>,
    /// Id of this node.
    ///
    /// Defaults to None, a random id or the one persisted with the routing
    /// table if [Config::persist_id] is set.
    pub id: Option<Id>,
    /// File to persist the routing table to, and restore it from on startup.
    ///
    /// Defaults to None, nothing is persisted.
    pub storage_path: Option<PathBuf>,
    /// Reuse the id stored in the routing table snapshot.
    ///
    /// Defaults to false.
    pub persist_id: bool,
    /// Hard timeout of a call.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Lower bound of the adaptive stall timeout.
    ///
    /// Defaults to [DEFAULT_TIMEOUT_BASELINE_MIN]
    pub request_timeout_baseline_min: Duration,
    /// Calls in flight at once, more are queued.
    ///
    /// Defaults to [DEFAULT_MAX_ACTIVE_CALLS]
    pub max_active_calls: usize,
    /// Interval of the routing table maintenance.
    ///
    /// Defaults to [DEFAULT_BUCKET_CHECK_INTERVAL]
    pub bucket_check_interval: Duration,
    /// Interval between routing table snapshots, if [Config::storage_path] is set.
    ///
    /// Defaults to [DEFAULT_SAVE_INTERVAL]
    pub save_interval: Duration,
    /// Tell other nodes not to add us to their routing tables, and don't
    /// answer their requests.
    ///
    /// Defaults to false.
    pub read_only: bool,
    /// Server to respond to incoming requests.
    ///
    /// Defaults to None, where the [crate::server::DefaultServer] will be used.
    pub server: Option<Box<dyn Server>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            port: None,
            bind_address: None,
            id: None,
            storage_path: None,
            persist_id: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            request_timeout_baseline_min: DEFAULT_TIMEOUT_BASELINE_MIN,
            max_active_calls: DEFAULT_MAX_ACTIVE_CALLS,
            bucket_check_interval: DEFAULT_BUCKET_CHECK_INTERVAL,
            save_interval: DEFAULT_SAVE_INTERVAL,
            read_only: false,
            server: None,
        }
    }
}

#[derive(Debug, Default)]
/// Fluent builder of a [Dht].
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Replace the bootstrap nodes.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = bootstrap.iter().map(|b| b.to_string()).collect();

        self
    }

    /// Add bootstrap nodes to the current ones.
    pub fn extra_bootstrap<T: ToString>(&mut self, extra: &[T]) -> &mut Self {
        self.0.bootstrap.extend(extra.iter().map(|b| b.to_string()));

        self
    }

    /// Don't bootstrap from anyone.
    pub fn no_bootstrap(&mut self) -> &mut Self {
        self.0.bootstrap = vec![];

        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = Some(port);

        self
    }

    pub fn bind_address(&mut self, address: IpAddr) -> &mut Self {
        self.0.bind_address = Some(address);

        self
    }

    pub fn id(&mut self, id: Id) -> &mut Self {
        self.0.id = Some(id);

        self
    }

    pub fn storage_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.0.storage_path = Some(path.into());

        self
    }

    pub fn persist_id(&mut self, persist_id: bool) -> &mut Self {
        self.0.persist_id = persist_id;

        self
    }

    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.request_timeout = timeout;

        self
    }

    pub fn request_timeout_baseline_min(&mut self, timeout: Duration) -> &mut Self {
        self.0.request_timeout_baseline_min = timeout;

        self
    }

    pub fn max_active_calls(&mut self, max: usize) -> &mut Self {
        self.0.max_active_calls = max;

        self
    }

    pub fn bucket_check_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.bucket_check_interval = interval;

        self
    }

    pub fn save_interval(&mut self, interval: Duration) -> &mut Self {
        self.0.save_interval = interval;

        self
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.0.read_only = read_only;

        self
    }

    pub fn server(&mut self, server: Box<dyn Server>) -> &mut Self {
        self.0.server = Some(server);

        self
    }

    /// Bind the socket and start the node.
    pub fn build(&mut self) -> crate::Result<Dht> {
        Dht::new(std::mem::take(&mut self.0))
    }
}
