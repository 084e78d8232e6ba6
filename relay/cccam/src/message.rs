use core::fmt;

use relay_core::utils::{c_str, copy_truncated};
use relay_core::{EcmRequest, ReadBe, RelayError, RelayResult};

use crate::constants::MAX_BODY_LEN;

/**
    Message command byte (header offset 1).
*/
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client identification, acknowledged by the server with the same command.
    ClientData = 0x00,
    /// ECM request from the client, control word answer from the server.
    Ecm = 0x01,
    CardRemoved = 0x04,
    /// Seen on the wire, meaning unknown; ignored.
    DcwSomething = 0x05,
    Ping = 0x06,
    NewCard = 0x07,
    ServerData = 0x08,
    CwNok1 = 0xFE,
    CwNok2 = 0xFF,
}

impl MessageType {
    pub const fn from_u8(u: u8) -> Option<Self> {
        match u {
            0x00 => Some(Self::ClientData),
            0x01 => Some(Self::Ecm),
            0x04 => Some(Self::CardRemoved),
            0x05 => Some(Self::DcwSomething),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::NewCard),
            0x08 => Some(Self::ServerData),
            0xFE => Some(Self::CwNok1),
            0xFF => Some(Self::CwNok2),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn to_name(self) -> &'static str {
        match self {
            Self::ClientData => "CLI_DATA",
            Self::Ecm => "ECM",
            Self::CardRemoved => "CARD_REMOVED",
            Self::DcwSomething => "DCW_SOMETHING",
            Self::Ping => "PING",
            Self::NewCard => "NEW_CARD",
            Self::ServerData => "SRV_DATA",
            Self::CwNok1 => "CW_NOK1",
            Self::CwNok2 => "CW_NOK2",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

/**
    Four-byte message header.

    Layout:
      [0]     flags (always zero when sent)
      [1]     command
      [2..4]  body length, u16 big-endian
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: u8,
    pub command: u8,
    pub len: u16,
}

impl Header {
    pub const LEN: usize = 4;

    pub fn new(command: MessageType, len: usize) -> RelayResult<Self> {
        if len > MAX_BODY_LEN {
            return Err(RelayError::MessageTooLarge {
                size: len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self {
            flags: 0,
            command: command.to_u8(),
            len: len as u16,
        })
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            flags: bytes[0],
            command: bytes[1],
            len: u16::from_be_bytes([bytes[2], bytes[3]]),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let [hi, lo] = self.len.to_be_bytes();
        [self.flags, self.command, hi, lo]
    }

    /**
        Validate the declared body length against the protocol maximum.
    */
    pub fn body_len(&self) -> RelayResult<usize> {
        let len = self.len as usize;
        if len > MAX_BODY_LEN {
            return Err(RelayError::MessageTooLarge {
                size: len,
                max: MAX_BODY_LEN,
            });
        }
        Ok(len)
    }
}

/**
    Encode a header + body into one plaintext buffer.
*/
pub fn encode(command: MessageType, body: &[u8]) -> RelayResult<Vec<u8>> {
    let header = Header::new(command, body.len())?;
    let mut buf = Vec::with_capacity(Header::LEN + body.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/**
    Client identification body.

    Layout:
      [0..20]   username (NUL padded)
      [20..28]  node id
      [28]      reserved
      [29..61]  version string (NUL padded)
      [61..93]  build string (NUL padded)
*/
pub const CLIENT_DATA_LEN: usize = 20 + 8 + 6 + 26 + 4 + 28 + 1;

pub fn client_data(
    username: &str,
    node_id: &[u8; 8],
    version: &str,
    build: &str,
) -> [u8; CLIENT_DATA_LEN] {
    let mut buf = [0u8; CLIENT_DATA_LEN];
    copy_truncated(&mut buf[..20], username.as_bytes());
    buf[20..28].copy_from_slice(node_id);
    copy_truncated(&mut buf[29..61], version.as_bytes());
    copy_truncated(&mut buf[61..], build.as_bytes());
    buf
}

/**
    ECM request body addressed to one card.

    Layout:
      [0..2]    caid
      [2..6]    provider id
      [6..10]   card id
      [10..12]  service id
      [12]      ECM length
      [13..]    ECM bytes
*/
pub fn ecm_body(caid: u16, card_id: u32, request: &EcmRequest) -> RelayResult<Vec<u8>> {
    let len = request.payload_len()?;
    let mut buf = Vec::with_capacity(13 + request.payload.len());
    buf.extend_from_slice(&caid.to_be_bytes());
    buf.extend_from_slice(&request.provider_id.to_be_bytes());
    buf.extend_from_slice(&card_id.to_be_bytes());
    buf.extend_from_slice(&request.service_id.to_be_bytes());
    buf.push(len);
    buf.extend_from_slice(&request.payload);
    Ok(buf)
}

/**
    Server identification, sent once after login.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerData {
    pub node_id: [u8; 8],
    pub version: String,
    pub build: String,
}

impl ServerData {
    /**
        Layout:
          [0..8]    server node id
          [8..40]   version string (NUL terminated)
          [40..72]  build string (NUL terminated)
    */
    pub fn parse(body: &[u8]) -> RelayResult<Self> {
        if body.len() < 8 {
            return Err(RelayError::ShortRead {
                expected: 8,
                actual: body.len(),
            });
        }
        let mut node_id = [0u8; 8];
        node_id.copy_from_slice(&body[..8]);

        let field = |start: usize, end: usize| {
            body.get(start..end.min(body.len()))
                .map(c_str)
                .unwrap_or_default()
        };

        Ok(Self {
            node_id,
            version: field(8, 40),
            build: field(40, 72),
        })
    }
}

/**
    Card id carried by a card removal message.
*/
pub fn removed_card_id(body: &[u8]) -> RelayResult<u32> {
    if body.len() < 4 {
        return Err(RelayError::ShortRead {
            expected: 4,
            actual: body.len(),
        });
    }
    Ok(body.u32_at(0))
}
