//! Fault-injecting TCP relay.
//!
//! `fray-proxy` sits between a client and an upstream service, forwards bytes
//! in both directions and lets an operator attach, update and detach an
//! ordered chain of "toxics" per direction while connections are live.
//!
//! # Architecture
//!
//! ```text
//! Registry (name -> Proxy)
//!       |
//!       v
//! Proxy (listener + accept loop)  <---- ToxicCollection (upstream, downstream)
//!       |                                        |
//!       | one Link per accepted connection       | immutable snapshots
//!       v                                        v
//! Link -- Stream upstream:   client   --> [toxic stages] --> upstream
//!      \- Stream downstream: upstream --> [toxic stages] --> client
//! ```
//!
//! # Components
//!
//! - [`Registry`]: name-keyed set of proxies, owned by the process entry point
//! - [`Proxy`]: listener lifecycle (`start`/`stop`) and the active link set
//! - [`ToxicCollection`]: per-direction ordered toxics, published as snapshots
//! - [`ToxicKind`]: the closed set of supported transforms
//!
//! # Usage
//!
//! ```ignore
//! use fray_proxy::{Direction, ProxyOptions, ProxySpec, Registry, ToxicSpec};
//!
//! let registry = Registry::new(ProxyOptions::default());
//! let proxy = registry
//!     .add(ProxySpec::new("redis", "127.0.0.1:26379", "127.0.0.1:6379"), true)
//!     .await?;
//!
//! proxy.toxics().add(ToxicSpec::new("slow", "latency", Direction::Downstream)
//!     .with_attribute("latency", 100.0))?;
//! ```

mod collection;
mod link;
mod proxy;
mod registry;
mod stream;
mod toxics;

pub use collection::{ToxicChain, ToxicCollection};
pub use proxy::{Proxy, ProxyOptions, ProxySpec};
pub use registry::{ProxyToxics, Registry};
pub use toxics::{Attributes, Direction, ToxicKind, ToxicSpec, ToxicWrapper};

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A proxy or toxic with this name already exists.
    #[error("Name already in use: {name}")]
    DuplicateName { name: String },

    /// No proxy with this name exists.
    #[error("Proxy not found: {name}")]
    NotFound { name: String },

    /// No toxic with this name exists in the given direction.
    #[error("Toxic not found: {name} ({direction})")]
    ToxicNotFound { name: String, direction: Direction },

    /// `start` was called on a proxy that is already listening.
    #[error("Proxy already started: {name}")]
    AlreadyStarted { name: String },

    /// The listen address is held by another socket.
    #[error("Address already in use: {addr}")]
    AddressInUse { addr: String },

    /// Failed to bind the listen address for any other reason.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Dialing the upstream for an accepted connection failed.
    #[error("Upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The toxic type name is not registered.
    #[error("Unknown toxic type: {kind}")]
    UnknownKind { kind: String },

    /// A toxic attribute or toxicity value is out of range.
    #[error("Invalid {field} for {kind} toxic: {message}")]
    InvalidAttribute {
        kind: String,
        field: String,
        message: String,
    },

    /// A bulk specification failed validation; nothing was changed.
    #[error("Invalid specification: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display_bind() {
        let err = ProxyError::Bind {
            addr: "127.0.0.1:8080".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_proxy_error_display_toxic_not_found() {
        let err = ProxyError::ToxicNotFound {
            name: "slow".to_string(),
            direction: Direction::Downstream,
        };
        assert_eq!(err.to_string(), "Toxic not found: slow (downstream)");
    }

    #[test]
    fn test_proxy_error_display_unknown_kind() {
        let err = ProxyError::UnknownKind {
            kind: "gremlin".to_string(),
        };
        assert!(err.to_string().contains("gremlin"));
    }

    #[test]
    fn test_proxy_error_upstream_keeps_source() {
        use std::error::Error;

        let err = ProxyError::UpstreamUnreachable {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.source().is_some());
    }
}
