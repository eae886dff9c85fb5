//! The runtime proxy actor.

pub mod proxy;

pub use proxy::{ProxyClient, ProxyDaemon, ProxyMessage};
