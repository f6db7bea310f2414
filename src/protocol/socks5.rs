//! SOCKS5 handshake and UDP datagram framing (RFC 1928)

use super::{Address, ProtocolError};
use bytes::{BufMut, BytesMut};

/// SOCKS protocol version
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method byte
pub const SOCKS5_METHOD_NO_AUTH: u8 = 0x00;

/// "No acceptable methods" selection byte
pub const SOCKS5_NO_ACCEPTABLE_METHOD: u8 = 0xFF;

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
}

impl Socks5Reply {
    /// Build the full reply message: `05 REP 00 ADDR`
    pub fn encode(self, bound: &Address) -> BytesMut {
        let mut buf = BytesMut::with_capacity(3 + bound.encoded_len());
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self as u8);
        buf.put_u8(0x00);
        bound.encode(&mut buf);
        buf
    }

    /// Reply with the all-zero IPv4 bound address
    pub fn encode_zero(self) -> BytesMut {
        self.encode(&Address::Ipv4([0, 0, 0, 0], 0))
    }
}

/// Validate a SOCKS5 greeting (`05 NMETHODS METHOD...`) and report
/// whether the no-auth method is offered.
///
/// The greeting must arrive whole: `len == NMETHODS + 2`.
pub fn validate_greeting(data: &[u8]) -> Result<bool, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::Malformed("short SOCKS5 greeting"));
    }
    if data[0] != SOCKS_VERSION {
        return Err(ProtocolError::InvalidSocksVersion(data[0]));
    }
    if data.len() != data[1] as usize + 2 {
        return Err(ProtocolError::Malformed("greeting length mismatch"));
    }
    Ok(data[2..].contains(&SOCKS5_METHOD_NO_AUTH))
}

/// Validate the fixed head of a SOCKS5 request (`05 CMD 00 ...`).
///
/// The command byte and the raw address bytes (`data[3..]`) are handed
/// back for the caller to re-frame; their validity is checked when the
/// composed request line is parsed back.
pub fn validate_request(data: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if data.len() < 7 {
        return Err(ProtocolError::Malformed("short SOCKS5 request"));
    }
    if data[0] != SOCKS_VERSION {
        return Err(ProtocolError::InvalidSocksVersion(data[0]));
    }
    if data[2] != 0 {
        return Err(ProtocolError::Malformed("non-zero reserved byte"));
    }
    Ok((data[1], &data[3..]))
}

/// A SOCKS5 UDP relay datagram: `RSV(2) FRAG(1) ADDR PAYLOAD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub address: Address,
    pub payload: BytesMut,
}

impl UdpDatagram {
    /// Parse a datagram received on the inner UDP socket.
    ///
    /// Only `FRAG=0` is supported; a non-zero fragment field (or a
    /// non-zero reserved field) is a protocol violation.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 3 {
            return Err(ProtocolError::Malformed("short UDP datagram"));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 0 {
            return Err(ProtocolError::Malformed("fragmented UDP datagram"));
        }
        let (address, consumed) = Address::decode(&data[3..])?
            .ok_or(ProtocolError::Malformed("truncated UDP address"))?;
        Ok(UdpDatagram {
            address,
            payload: BytesMut::from(&data[3 + consumed..]),
        })
    }

    /// Encode for delivery back to the local client via `send_to`
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(3 + self.address.encoded_len() + self.payload.len());
        buf.put_slice(&[0, 0, 0]);
        self.address.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }
}
