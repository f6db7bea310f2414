//! Wire protocol codecs
//!
//! Provides:
//! - SOCKS5-style address triples
//! - SOCKS5 handshake/request/UDP datagram framing
//! - The authenticated request line placed ahead of relay payload
//! - Pipeline frames for multiplexed carriers

mod address;
mod pipeline;
pub mod socks5;
mod trojan;

pub use address::{Address, ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6};
pub use pipeline::{PipelineCommand, PipelineFrame, PIPELINE_FRAME_HEADER_SIZE};
pub use socks5::{
    Socks5Reply, UdpDatagram, SOCKS_VERSION, SOCKS5_METHOD_NO_AUTH, SOCKS5_NO_ACCEPTABLE_METHOD,
};
pub use trojan::{hash_password, TrojanCommand, TrojanRequest, TrojanUdpPacket, PASSWORD_HEX_LEN};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    #[error("Empty domain name")]
    EmptyDomain,

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Malformed request: {0}")]
    Malformed(&'static str),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// CRLF terminator used by the request line and UDP framing
pub const CRLF: &[u8] = b"\r\n";
