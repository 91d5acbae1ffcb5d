//! `host:port` splitting shared by the gatekeeper and the startup config.
//!
//! Splitting is purely textual: no case folding, no default ports, no DNS.
//! Bracketed IPv6 literals (`[::1]:443`) are the only form allowed to carry
//! colons in the host part.

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("address {0}: missing port in address")]
    MissingPort(String),
    #[error("address {0}: too many colons in address")]
    TooManyColons(String),
    #[error("address {0}: missing ']' in address")]
    MissingBracket(String),
    #[error("address {0}: unexpected '[' in address")]
    UnexpectedOpenBracket(String),
    #[error("address {0}: unexpected ']' in address")]
    UnexpectedCloseBracket(String),
}

/// Splits `host:port` (or `[host]:port`) into its host and port parts.
///
/// Either part may come back empty (`"example.com:"` splits into
/// `("example.com", "")`); callers that need both decide what to do with that.
pub fn split_host_port(hostport: &str) -> Result<(&str, &str), AddrError> {
    let colon = hostport
        .rfind(':')
        .ok_or_else(|| AddrError::MissingPort(hostport.to_string()))?;

    let (host, open_from, close_from) = if hostport.starts_with('[') {
        let end = hostport
            .find(']')
            .ok_or_else(|| AddrError::MissingBracket(hostport.to_string()))?;
        if end + 1 == hostport.len() {
            return Err(AddrError::MissingPort(hostport.to_string()));
        }
        if end + 1 != colon {
            return Err(if hostport.as_bytes()[end + 1] == b':' {
                AddrError::TooManyColons(hostport.to_string())
            } else {
                AddrError::MissingPort(hostport.to_string())
            });
        }
        (&hostport[1..end], 1, end + 1)
    } else {
        let host = &hostport[..colon];
        if host.contains(':') {
            return Err(AddrError::TooManyColons(hostport.to_string()));
        }
        (host, 0, 0)
    };

    if hostport[open_from..].contains('[') {
        return Err(AddrError::UnexpectedOpenBracket(hostport.to_string()));
    }
    if hostport[close_from..].contains(']') {
        return Err(AddrError::UnexpectedCloseBracket(hostport.to_string()));
    }

    Ok((host, &hostport[colon + 1..]))
}

/// Inverse of [`split_host_port`]; hosts containing a colon get bracketed.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
