//! A forward proxy that only opens CONNECT tunnels to one configured
//! `host:port`, then relays raw bytes until either end closes.

pub mod authority;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod relay;
pub mod server;

pub use config::{ConfigError, ProxyConfig};
pub use error::TunnelError;
pub use gatekeeper::{DialTarget, Gatekeeper, TunnelRequest};
pub use relay::{pipe, RelayStats};
pub use server::spawn_proxy;
