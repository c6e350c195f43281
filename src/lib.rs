//! Conditional DNS forwarder that races a local resolver against a remote
//! resolver reached through a SOCKS5 proxy.

pub mod acl;
pub mod config;
pub mod error;
pub mod hosts;
pub mod proto_utils;
pub mod reactor;
pub mod resolver;
pub mod server;
pub mod socks5;
pub mod watcher;

pub use error::{Error, Result};
pub use server::{DnsServerConfig, LocalDnsServer};
