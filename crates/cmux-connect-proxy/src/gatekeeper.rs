//! Allow/deny decisions for tunnel requests and the single upstream dial.
//!
//! A request is allowed only when it is a CONNECT whose authority splits into
//! exactly the configured host and port. Nothing is normalized: `Example.com`
//! does not match `example.com`, and `example.com` does not match
//! `example.com:443`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Method, Request};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::authority::split_host_port;
use crate::config::ProxyConfig;
use crate::error::TunnelError;

/// The parts of an inbound request the gatekeeper looks at.
#[derive(Clone, Debug)]
pub struct TunnelRequest {
    method: Method,
    authority: String,
}

impl TunnelRequest {
    pub fn new(method: Method, authority: impl Into<String>) -> Self {
        Self {
            method,
            authority: authority.into(),
        }
    }

    /// Only an authority-form target (`host:port`) is read. Any other form,
    /// including `http://host:port/`, gets an empty authority, which never
    /// splits.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let uri = req.uri();
        let authority = match uri.authority() {
            Some(authority) if uri.scheme().is_none() && uri.path_and_query().is_none() => {
                authority.as_str()
            }
            _ => "",
        };
        Self::new(req.method().clone(), authority)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// Where an allowed tunnel is dialed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialTarget {
    /// The configured target IP override.
    Addr(SocketAddr),
    /// The requested authority, resolved by the OS at dial time.
    Authority(String),
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Addr(addr) => addr.fmt(f),
            DialTarget::Authority(authority) => f.write_str(authority),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Gatekeeper {
    config: Arc<ProxyConfig>,
}

impl Gatekeeper {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Runs the method and authority checks and picks the dial target.
    pub fn authorize(&self, req: &TunnelRequest) -> Result<DialTarget, TunnelError> {
        let configured = self.config.target();

        if req.method() != Method::CONNECT {
            warn!(method = %req.method(), "rejecting non-CONNECT request");
            return Err(TunnelError::MethodNotAllowed);
        }

        debug!(requested = req.authority(), configured, "received tunnel request");
        if let Err(err) = compare_authorities(req.authority(), &self.config) {
            warn!(requested = req.authority(), configured, error = %err, "rejecting tunnel request");
            return Err(err);
        }

        let target = match self.config.target_ip() {
            Some(addr) => DialTarget::Addr(addr),
            None => DialTarget::Authority(req.authority().to_string()),
        };
        info!(requested = req.authority(), %target, "allowing tunnel request");
        Ok(target)
    }

    /// One connect attempt, bounded only by the OS connect timeout.
    pub async fn dial(&self, target: &DialTarget) -> Result<TcpStream, TunnelError> {
        debug!(%target, "dialing upstream");
        let result = match target {
            DialTarget::Addr(addr) => TcpStream::connect(*addr).await,
            DialTarget::Authority(authority) => TcpStream::connect(authority.as_str()).await,
        };
        let stream = result.map_err(|source| {
            error!(%target, configured = self.config.target(), error = %source, "failed to dial upstream");
            TunnelError::DialFailure(source)
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%target, error = %err, "failed to set TCP_NODELAY on upstream");
        }
        Ok(stream)
    }
}

/// The requested authority must split, and its host and port strings must
/// equal the configured ones.
pub fn compare_authorities(requested: &str, config: &ProxyConfig) -> Result<(), TunnelError> {
    let (host, port) = split_host_port(requested)?;
    if host != config.target_host() || port != config.target_port() {
        return Err(TunnelError::AuthorityMismatch {
            requested: requested.to_string(),
            configured: config.target().to_string(),
        });
    }
    Ok(())
}
