use core::fmt;

/**
    A decryption request handed to a protocol session by the dispatcher.
*/
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcmRequest {
    /// Conditional access system id.
    pub caid: u16,
    /// Provider (operator) id. CCcam matches on the low 24 bits.
    pub provider_id: u32,
    /// Service (program) id.
    pub service_id: u16,
    /// ECM pid the request was read from.
    pub pid: u16,
    /// Request index assigned by the dispatcher, echoed back with the answer.
    pub index: u16,
    /// Raw ECM bytes.
    pub payload: Vec<u8>,
}

impl EcmRequest {
    /**
        Length byte as carried on the wire (both protocols use a single byte).
    */
    pub fn payload_len(&self) -> crate::RelayResult<u8> {
        u8::try_from(self.payload.len()).map_err(|_| crate::RelayError::MessageTooLarge {
            size: self.payload.len(),
            max: u8::MAX as usize,
        })
    }
}

/**
    An entitlement update forwarded to a remote card.
*/
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmmPacket {
    pub caid: u16,
    pub provider_id: [u8; 4],
    pub payload: Vec<u8>,
}

/**
    A decrypted control word pair (odd + even, 8 bytes each).
*/
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlWord(pub [u8; 16]);

impl ControlWord {
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for ControlWord {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlWord({self})")
    }
}

/**
    Why a server asked the client to stop sending requests.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The request can not be served; the capability is marked failed.
    Invalid,
    /// The server is sleeping; the capability is unavailable but not failed.
    Sleep,
}

impl StopReason {
    pub const fn to_name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Sleep => "sleeping",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_name())
    }
}

/**
    One provider entry of an upstream card.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderInfo {
    /// Provider id, big-endian.
    pub id: [u8; 4],
    /// Shared address used for EMM filtering.
    pub sa: [u8; 4],
}

/**
    Which EMM classes the upstream card accepts.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmFilter {
    pub global: bool,
    pub shared: bool,
    pub unique: bool,
}

impl Default for EmmFilter {
    fn default() -> Self {
        Self {
            global: true,
            shared: true,
            unique: true,
        }
    }
}

/**
    Description of an upstream hardware unit (a physical card behind a reader),
    exchanged so that peers can route entitlement updates to it.
*/
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardInfo {
    /// Zero when no card is present.
    pub caid: u16,
    pub serial: [u8; 8],
    pub providers: Vec<ProviderInfo>,
    pub emm: EmmFilter,
}

impl CardInfo {
    pub fn has_card(&self) -> bool {
        self.caid != 0
    }
}

/**
    Outcome of a single `receive` call on a session.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A control word for the request with the given index.
    ControlWord { index: u16, cw: ControlWord },
    /// The server could not answer the request.
    Rejected { index: u16 },
    /// The server asked to stop sending this kind of request.
    Stopped { index: u16, reason: StopReason },
    /// The server described its card (EMM provisioning).
    CardInfo(CardInfo),
    /// A keepalive was answered.
    KeepaliveHandled,
    /// The peer closed the connection.
    PeerClosed,
    /// The message was consumed without anything to report.
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_display_is_hex() {
        let cw = ControlWord([0xAB; 16]);
        assert_eq!(cw.to_string(), "ab".repeat(16));
    }

    #[test]
    fn payload_len_rejects_oversized() {
        let req = EcmRequest {
            payload: vec![0; 256],
            ..Default::default()
        };
        assert!(matches!(
            req.payload_len(),
            Err(crate::RelayError::MessageTooLarge { size: 256, max: 255 })
        ));
    }

    #[test]
    fn empty_card_info_has_no_card() {
        assert!(!CardInfo::default().has_card());
    }
}
