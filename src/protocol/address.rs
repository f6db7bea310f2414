//! SOCKS5-compatible address triple codec
//!
//! Wire format:
//! ```text
//! +------+----------+------+
//! | TYPE |   HOST   | PORT |
//! +------+----------+------+
//! |  1   | variable |  2   |
//! +------+----------+------+
//! ```
//!
//! `TYPE=1` is a 4-byte IPv4 host, `TYPE=3` a length-prefixed domain
//! name, `TYPE=4` a 16-byte IPv6 host. The port is network order.

use super::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IPv4 address type byte
pub const ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain address type byte
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address type byte
pub const ADDR_TYPE_IPV6: u8 = 0x04;

/// A destination address as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// Domain name and port
    Domain(String, u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
}

impl Address {
    /// Decode an address from the front of `buf`.
    ///
    /// Returns the address and the number of bytes consumed, `Ok(None)`
    /// when more bytes are needed, or an error for input that can never
    /// become valid.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            ADDR_TYPE_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((Address::Ipv4(ip, port), 7)))
            }
            ADDR_TYPE_DOMAIN => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let len = buf[1] as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDomain);
                }
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| ProtocolError::Malformed("domain is not UTF-8"))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((Address::Domain(domain, port), total)))
            }
            ADDR_TYPE_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Some((Address::Ipv6(ip, port), 19)))
            }
            other => Err(ProtocolError::InvalidAddressType(other)),
        }
    }

    /// Append the wire encoding of this address to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ADDR_TYPE_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ADDR_TYPE_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ADDR_TYPE_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
            }
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 7,
            Address::Domain(domain, _) => 4 + domain.len(),
            Address::Ipv6(..) => 19,
        }
    }

    /// Destination port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// A `host:port` string suitable for `tokio::net::lookup_host`
    pub fn to_target_string(&self) -> String {
        match self {
            Address::Ipv4(ip, port) => format!("{}:{}", Ipv4Addr::from(*ip), port),
            Address::Domain(domain, port) => format!("{}:{}", domain, port),
            Address::Ipv6(ip, port) => format!("[{}]:{}", Ipv6Addr::from(*ip), port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Address::Ipv6(ip.octets(), addr.port()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_target_string())
    }
}
