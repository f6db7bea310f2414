//! Authenticated request line framing
//!
//! The first bytes a client sends inside the TLS stream:
//!
//! ```text
//! +-----------------------+
//! | hex(SHA224(password)) |  56 bytes
//! +-----------------------+
//! | CRLF                  |  2 bytes
//! +-----------------------+
//! | Command               |  1 byte (0x01=CONNECT, 0x03=UDP)
//! +-----------------------+
//! | Address triple        |  variable
//! +-----------------------+
//! | CRLF                  |  2 bytes
//! +-----------------------+
//! | Payload               |  variable
//! +-----------------------+
//! ```

use super::{Address, ProtocolError, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha224};

/// Length of the hex-encoded password digest
pub const PASSWORD_HEX_LEN: usize = 56;

/// Request commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrojanCommand {
    /// TCP connect
    Connect = 0x01,
    /// UDP associate
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for TrojanCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TrojanCommand::Connect),
            0x03 => Ok(TrojanCommand::UdpAssociate),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }
}

/// Hash a password into its 56-character lowercase hex authenticator
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// A parsed request line plus whatever payload followed it
#[derive(Debug, Clone)]
pub struct TrojanRequest {
    pub password_hex: String,
    pub command: TrojanCommand,
    pub address: Address,
    pub payload: Bytes,
}

impl TrojanRequest {
    /// Compose the wire form: `<pw-hex> CRLF <cmd> <addr> CRLF <payload>`
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            PASSWORD_HEX_LEN + 4 + 1 + self.address.encoded_len() + self.payload.len(),
        );
        buf.put_slice(self.password_hex.as_bytes());
        buf.put_slice(CRLF);
        buf.put_u8(self.command as u8);
        self.address.encode(&mut buf);
        buf.put_slice(CRLF);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse a request from the front of `data`.
    ///
    /// `Ok(None)` means the bytes so far are a valid prefix and more
    /// input may complete it; an error means no extension of `data` can
    /// ever parse, which is what routes a probe to the decoy.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let head = data.len().min(PASSWORD_HEX_LEN);
        if !data[..head]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        {
            return Err(ProtocolError::Malformed("authenticator is not lowercase hex"));
        }
        if data.len() < PASSWORD_HEX_LEN + 2 {
            return Ok(None);
        }
        if &data[PASSWORD_HEX_LEN..PASSWORD_HEX_LEN + 2] != CRLF {
            return Err(ProtocolError::Malformed("missing CRLF after authenticator"));
        }
        // Safe: the prefix was just checked to be ASCII hex
        let password_hex =
            std::str::from_utf8(&data[..PASSWORD_HEX_LEN]).unwrap().to_string();

        let rest = &data[PASSWORD_HEX_LEN + 2..];
        if rest.is_empty() {
            return Ok(None);
        }
        let command = TrojanCommand::try_from(rest[0])?;
        let (address, consumed) = match Address::decode(&rest[1..])? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        let tail = &rest[1 + consumed..];
        if tail.len() < 2 {
            return Ok(None);
        }
        if &tail[..2] != CRLF {
            return Err(ProtocolError::Malformed("missing CRLF after address"));
        }

        Ok(Some(TrojanRequest {
            password_hex,
            command,
            address,
            payload: Bytes::copy_from_slice(&tail[2..]),
        }))
    }
}

/// A UDP datagram as framed inside the outer TCP/TLS stream:
/// `<addr-triple> <len:u16-BE> CRLF <payload>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanUdpPacket {
    pub address: Address,
    pub payload: Bytes,
}

impl TrojanUdpPacket {
    pub fn encode(&self) -> BytesMut {
        let mut buf =
            BytesMut::with_capacity(self.address.encoded_len() + 4 + self.payload.len());
        self.address.encode(&mut buf);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(CRLF);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse one packet from the front of `data`, returning it with the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let (address, addr_len) = match Address::decode(data)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        let rest = &data[addr_len..];
        if rest.len() < 4 {
            return Ok(None);
        }
        let payload_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if &rest[2..4] != CRLF {
            return Err(ProtocolError::Malformed("missing CRLF in UDP packet"));
        }
        if rest.len() < 4 + payload_len {
            return Ok(None);
        }
        Ok(Some((
            TrojanUdpPacket {
                address,
                payload: Bytes::copy_from_slice(&rest[4..4 + payload_len]),
            },
            addr_len + 4 + payload_len,
        )))
    }
}
