use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tracing::warn;

use crate::authority::{join_host_port, split_host_port, AddrError};

pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_TARGET_PORT: &str = "443";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("target must not be empty")]
    EmptyTarget,
    #[error("invalid target {target}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: AddrError,
    },
    #[error("target {0} must name both a host and a port")]
    IncompleteTarget(String),
    #[error("invalid target ip {0}: expected an IP address or IP:port")]
    InvalidTargetIp(String),
    #[error("target port {port} is not numeric and cannot be combined with target ip {ip}")]
    NonNumericTargetPort { port: String, ip: IpAddr },
}

/// Immutable proxy settings, built once at startup and shared by every request.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    listen: SocketAddr,
    target: String,
    target_host: String,
    target_port: String,
    target_ip: Option<SocketAddr>,
}

impl ProxyConfig {
    /// Validates `target` (appending the default port when it has none) and
    /// resolves `target_ip` against the target's port.
    pub fn new(
        listen: SocketAddr,
        target: &str,
        target_ip: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let target = normalize_target(target)?;
        let (host, port) = split_host_port(&target).map_err(|source| ConfigError::InvalidTarget {
            target: target.clone(),
            source,
        })?;
        let (target_host, target_port) = (host.to_string(), port.to_string());

        let target_ip = match target_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(raw) => Some(parse_target_ip(raw, &target_port)?),
            None => None,
        };

        Ok(Self {
            listen,
            target,
            target_host,
            target_port,
            target_ip,
        })
    }

    /// Listens on every interface, the way the binary runs.
    pub fn on_port(
        listen_port: u16,
        target: &str,
        target_ip: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port);
        Self::new(listen, target, target_ip)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// The effective `host:port` requests must match.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> &str {
        &self.target_port
    }

    /// Address dialed instead of the requested authority, when configured.
    pub fn target_ip(&self) -> Option<SocketAddr> {
        self.target_ip
    }
}

/// Appends [`DEFAULT_TARGET_PORT`] to a target given without one.
pub fn normalize_target(target: &str) -> Result<String, ConfigError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ConfigError::EmptyTarget);
    }

    let normalized = if target.parse::<Ipv6Addr>().is_ok() {
        join_host_port(target, DEFAULT_TARGET_PORT)
    } else {
        match split_host_port(target) {
            Ok(_) => target.to_string(),
            Err(AddrError::MissingPort(_)) => {
                let host = target.trim_start_matches('[').trim_end_matches(']');
                join_host_port(host, DEFAULT_TARGET_PORT)
            }
            Err(source) => {
                return Err(ConfigError::InvalidTarget {
                    target: target.to_string(),
                    source,
                })
            }
        }
    };

    if normalized != target {
        warn!(target, effective = %normalized, "target has no port, using default");
    }

    match split_host_port(&normalized) {
        Ok((host, port)) if !host.is_empty() && !port.is_empty() => Ok(normalized),
        Ok(_) => Err(ConfigError::IncompleteTarget(normalized)),
        Err(source) => Err(ConfigError::InvalidTarget {
            target: normalized,
            source,
        }),
    }
}

fn parse_target_ip(raw: &str, target_port: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = raw
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| ConfigError::InvalidTargetIp(raw.to_string()))?;
    let port = target_port
        .parse::<u16>()
        .map_err(|_| ConfigError::NonNumericTargetPort {
            port: target_port.to_string(),
            ip,
        })?;
    Ok(SocketAddr::new(ip, port))
}
