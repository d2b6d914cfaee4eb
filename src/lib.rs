#![doc = include_str!("../README.md")]

mod common;
mod config;
mod dht;
mod error;
pub mod routing;
pub mod rpc;
pub mod server;

pub use crate::common::{
    messages, ClosestNodes, Contact, Id, Message, MessageType, Prefix, MAX_BUCKET_SIZE_K,
};
pub use config::{Config, DhtBuilder, DEFAULT_BOOTSTRAP_NODES};
pub use dht::{Dht, Testnet};
pub use error::{Error, Result};
