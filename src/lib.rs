//! # Veil Proxy
//!
//! A circumvention proxy that tunnels TCP (and optionally UDP) traffic
//! inside a TLS connection that is indistinguishable, on the wire, from
//! an ordinary HTTPS session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Local Applications                  │
//! │            (SOCKS5, forwarded/NAT flows)             │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │     (SOCKS5 handshake, request framing, relay)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Pipeline Layer                      │
//! │   (optional: many sessions over one TLS, ACK flow)   │
//! ├─────────────────────────────────────────────────────┤
//! │                    TLS Transport                     │
//! │        (rustls, SNI/ALPN, session resumption)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The server side authenticates the first bytes of every TLS stream
//! against a set of hashed passwords; anything that fails to
//! authenticate is handed to a decoy HTTP responder so active probes
//! see a plausible webserver.

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod service;
pub mod session;
pub mod tls;

pub use config::Config;
pub use service::Service;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Read buffer size for relay sockets
pub const MAX_BUF_LENGTH: usize = 8192;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Resource exhausted: {0}")]
    Exhausted(String),
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}
