use core::fmt;

use tracing::debug;

use relay_core::{ReadBe, RelayError, RelayResult, boundary};

use crate::crypto::{Credential, FrameCipher, Keyring};

/// Fixed routing header in front of every body.
pub const HEADER_LEN: usize = 20;
/// Extra block carried after the body of cascading ECM requests and answers.
pub const TRAILER_LEN: usize = 0x34;
/// One request slot: largest body, header and trailer.
pub const REQ_SIZE: usize = 256 + HEADER_LEN + TRAILER_LEN;
/// Smallest datagram that can hold a frame (CRC + header).
pub const MIN_RAW_LEN: usize = 24;

/**
    Command byte (frame offset 0).
*/
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ecm = 0x00,
    Cw = 0x01,
    /// Obsolete EMM command, never sent.
    EmmLegacy = 0x02,
    CascadeEcm = 0x03,
    CascadeCw = 0x04,
    /// Card data pushed by the server so the client can route EMMs.
    EmmRequest = 0x05,
    Emm = 0x06,
    Stop = 0x08,
    /// EMM variant only seen with caid 0x1830.
    Emm19 = 0x13,
    /// Legacy rejection.
    Reject = 0x44,
}

impl Command {
    pub const fn from_u8(u: u8) -> Option<Self> {
        match u {
            0x00 => Some(Self::Ecm),
            0x01 => Some(Self::Cw),
            0x02 => Some(Self::EmmLegacy),
            0x03 => Some(Self::CascadeEcm),
            0x04 => Some(Self::CascadeCw),
            0x05 => Some(Self::EmmRequest),
            0x06 => Some(Self::Emm),
            0x08 => Some(Self::Stop),
            0x13 => Some(Self::Emm19),
            0x44 => Some(Self::Reject),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn has_trailer(command: u8) -> bool {
        matches!(command, 0x03 | 0x04)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CMD{:02X}", self.to_u8())
    }
}

/**
    Length of a plain frame: header, body and trailer rounded up to 4 bytes.
*/
pub const fn frame_len(command: u8, len: u8) -> usize {
    let trailer = if Command::has_trailer(command) {
        TRAILER_LEN
    } else {
        0
    };
    boundary(4, HEADER_LEN + len as usize + trailer)
}

/**
    View over a plain (decrypted) frame.

    Layout:
      [0]       command
      [1]       body length
      [2..4]    reserved
      [4..8]    CRC32 of the body, big-endian
      [8..10]   service id
      [10..12]  caid
      [12..16]  provider id
      [16..18]  request index (pid on the server side)
      [18..20]  0xFF 0xFF for ECM requests
      [20..]    body, then the trailer for commands 3 and 4
*/
#[derive(Clone, PartialEq, Eq)]
pub struct Frame<B = Vec<u8>> {
    buf: B,
}

impl Frame<Vec<u8>> {
    /**
        Empty frame for `command` with a body of `len` bytes, body
        pre-filled with 0xFF.
    */
    pub fn with_len(command: Command, len: u8) -> Self {
        let size = frame_len(command.to_u8(), len);
        let mut buf = vec![0u8; size];
        buf[HEADER_LEN..].fill(0xFF);
        buf[0] = command.to_u8();
        buf[1] = len;
        Self { buf }
    }
}

impl<B: AsRef<[u8]>> Frame<B> {
    /**
        Wrap `buf`, checking that it holds the whole frame its header declares.
    */
    pub fn new_checked(buf: B) -> RelayResult<Self> {
        let bytes = buf.as_ref();
        if bytes.len() < HEADER_LEN {
            return Err(RelayError::ShortRead {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let expected = frame_len(bytes[0], bytes[1]);
        if bytes.len() < expected {
            return Err(RelayError::IncompleteRequest {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { buf })
    }

    /// Callers guarantee `buf` is at least [`REQ_SIZE`] long.
    pub(crate) fn from_slot(buf: B) -> Self {
        Self { buf }
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn command(&self) -> u8 {
        self.bytes()[0]
    }

    pub fn len(&self) -> u8 {
        self.bytes()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checksum(&self) -> u32 {
        self.bytes().u32_at(4)
    }

    pub fn service_id(&self) -> u16 {
        self.bytes().u16_at(8)
    }

    pub fn caid(&self) -> u16 {
        self.bytes().u16_at(10)
    }

    pub fn provider_id(&self) -> u32 {
        self.bytes().u32_at(12)
    }

    pub fn provider_bytes(&self) -> [u8; 4] {
        let b = self.bytes();
        [b[12], b[13], b[14], b[15]]
    }

    pub fn index(&self) -> u16 {
        self.bytes().u16_at(16)
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes()[HEADER_LEN..HEADER_LEN + self.len() as usize]
    }

    pub fn trailer(&self) -> Option<&[u8]> {
        if !Command::has_trailer(self.command()) {
            return None;
        }
        let start = HEADER_LEN + self.len() as usize;
        Some(&self.bytes()[start..start + TRAILER_LEN])
    }

    /**
        Length of the plain frame as declared by its header.
    */
    pub fn frame_len(&self) -> usize {
        frame_len(self.command(), self.len())
    }

    /**
        The plain frame bytes, without anything past the declared length.
    */
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes()[..self.frame_len()]
    }

    /**
        Returns `true` when the body matches the transmitted CRC.
    */
    pub fn verify(&self) -> bool {
        crc32fast::hash(self.body()) == self.checksum()
    }

    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Frame<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    pub fn set_command(&mut self, command: Command) {
        self.bytes_mut()[0] = command.to_u8();
    }

    pub fn set_len(&mut self, len: u8) {
        self.bytes_mut()[1] = len;
    }

    pub fn set_service_id(&mut self, service_id: u16) {
        self.bytes_mut()[8..10].copy_from_slice(&service_id.to_be_bytes());
    }

    pub fn set_caid(&mut self, caid: u16) {
        self.bytes_mut()[10..12].copy_from_slice(&caid.to_be_bytes());
    }

    pub fn set_provider_id(&mut self, provider_id: u32) {
        self.bytes_mut()[12..16].copy_from_slice(&provider_id.to_be_bytes());
    }

    pub fn set_index(&mut self, index: u16) {
        self.bytes_mut()[16..18].copy_from_slice(&index.to_be_bytes());
    }

    /**
        Mark the frame as an ECM request (offsets 18..20).
    */
    pub fn set_request_marker(&mut self) {
        self.bytes_mut()[18..20].copy_from_slice(&[0xFF, 0xFF]);
    }

    /**
        Replace the body and its declared length. The buffer must have room
        for the new body.
    */
    pub fn set_body(&mut self, body: &[u8]) {
        let len = body.len();
        debug_assert!(len <= u8::MAX as usize);
        let bytes = self.bytes_mut();
        bytes[1] = len as u8;
        bytes[HEADER_LEN..HEADER_LEN + len].copy_from_slice(body);
    }

    /**
        Mutable access to the raw buffer for layouts without named fields.
    */
    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.bytes_mut()
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for Frame<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("command", &self.command())
            .field("len", &self.len())
            .field("service_id", &self.service_id())
            .field("caid", &self.caid())
            .field("provider_id", &self.provider_id())
            .field("index", &self.index())
            .finish()
    }
}

/**
    Seal a plain frame for the wire.

    The body CRC is written, the frame is padded with 0xFF to a whole number
    of AES blocks, encrypted and prefixed with the sender's user CRC.
*/
pub fn seal<B: AsRef<[u8]>>(frame: &Frame<B>, credential: &Credential) -> Vec<u8> {
    let plain = frame.as_bytes();
    let sealed_len = boundary(FrameCipher::BLOCK_LEN, plain.len());

    let mut raw = Vec::with_capacity(4 + sealed_len);
    raw.extend_from_slice(&credential.ucrc());
    raw.extend_from_slice(plain);
    raw.resize(4 + sealed_len, 0xFF);

    let crc = crc32fast::hash(frame.body());
    raw[8..12].copy_from_slice(&crc.to_be_bytes());

    credential.cipher().encrypt(&mut raw[4..]);
    raw
}

/**
    Run an inbound frame through the receive pipeline.

    Each stage short-circuits:
      1. at least [`MIN_RAW_LEN`] bytes, else `ShortRead`
      2. the leading CRC must name a known account, else `UnknownUser`
      3. decrypt the remainder
      4. the declared length must fit in what arrived, else `IncompleteRequest`;
         surplus bytes are dropped as padding
      5. the body CRC must match, else `ChecksumError`
*/
pub fn open(raw: &[u8], keyring: &mut dyn Keyring) -> RelayResult<Frame> {
    if raw.len() < MIN_RAW_LEN {
        return Err(RelayError::ShortRead {
            expected: MIN_RAW_LEN,
            actual: raw.len(),
        });
    }

    let ucrc = [raw[0], raw[1], raw[2], raw[3]];
    let cipher = keyring.cipher_for(ucrc)?;

    let mut plain = raw[4..].to_vec();
    if plain.len() % FrameCipher::BLOCK_LEN != 0 {
        debug!(len = plain.len(), "frame size is not a whole number of blocks");
    }
    cipher.decrypt(&mut plain);

    let expected = frame_len(plain[0], plain[1]);
    if expected > plain.len() {
        return Err(RelayError::IncompleteRequest {
            expected,
            actual: plain.len(),
        });
    }
    if expected < plain.len() {
        debug!(surplus = plain.len() - expected, "ignoring padding");
        plain.truncate(expected);
    }

    let frame = Frame { buf: plain };
    if !frame.verify() {
        return Err(RelayError::ChecksumError);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    const SEALED_ECM: [u8; 36] = hex!(
        "dd030b17b45bf31b656644b43e9a65d739c1a6ab5e13dd0b"
        "6b95db430a85e9ea702af0b0"
    );

    fn ecm() -> Frame {
        let mut frame = Frame::with_len(Command::Ecm, 3);
        frame.set_service_id(0x0101);
        frame.set_caid(0x1234);
        frame.set_provider_id(0x000A0B0C);
        frame.set_index(7);
        frame.set_request_marker();
        frame.set_body(&[0x80, 0x30, 0x01]);
        frame
    }

    fn credential() -> Credential {
        Credential::new("user", "pass")
    }

    #[test]
    fn sealed_ecm_matches_reference() {
        assert_eq!(seal(&ecm(), &credential()), SEALED_ECM);
    }

    #[test]
    fn open_reverses_seal() {
        let frame = open(&SEALED_ECM, &mut credential()).unwrap();
        assert_eq!(frame.command(), 0x00);
        assert_eq!(frame.service_id(), 0x0101);
        assert_eq!(frame.caid(), 0x1234);
        assert_eq!(frame.provider_id(), 0x000A0B0C);
        assert_eq!(frame.index(), 7);
        assert_eq!(frame.body(), &[0x80, 0x30, 0x01]);
        assert_eq!(frame.checksum(), 0xB635C4F7);
        assert_eq!(frame.as_bytes().len(), 24);
    }

    #[test]
    fn frame_lengths() {
        assert_eq!(frame_len(0x00, 0), 20);
        assert_eq!(frame_len(0x00, 3), 24);
        assert_eq!(frame_len(0x01, 16), 36);
        assert_eq!(frame_len(0x03, 3), 76);
        assert_eq!(frame_len(0x04, 16), 88);
        assert_eq!(frame_len(0x03, 255), 328);
        assert_eq!(REQ_SIZE, 328);
    }

    #[test]
    fn too_short() {
        assert_eq!(
            open(&SEALED_ECM[..20], &mut credential()).err(),
            Some(RelayError::ShortRead {
                expected: 24,
                actual: 20
            })
        );
    }

    #[test]
    fn corrupted_user_crc() {
        let mut raw = SEALED_ECM;
        raw[0] ^= 0x01;
        assert_eq!(
            open(&raw, &mut credential()).err(),
            Some(RelayError::UnknownUser)
        );
    }

    #[test]
    fn wrong_password_fails_checksum() {
        let mut other = Credential::new("user", "other");
        let frame = open(&SEALED_ECM, &mut other);
        assert!(matches!(
            frame,
            Err(RelayError::ChecksumError) | Err(RelayError::IncompleteRequest { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_incomplete() {
        let mut frame = Frame::with_len(Command::Ecm, 40);
        frame.set_body(&[0x11; 40]);
        let raw = seal(&frame, &credential());
        assert_eq!(raw.len(), 4 + 64);
        assert_eq!(
            open(&raw[..4 + 48], &mut credential()).err(),
            Some(RelayError::IncompleteRequest {
                expected: 60,
                actual: 48
            })
        );
    }

    #[test]
    fn cascading_frame_keeps_trailer() {
        let mut frame = Frame::with_len(Command::CascadeEcm, 2);
        frame.set_body(&[0xAB, 0xCD]);
        frame.raw_mut()[22..22 + TRAILER_LEN].fill(0x5A);
        let opened = open(&seal(&frame, &credential()), &mut credential()).unwrap();
        assert_eq!(opened.frame_len(), 76);
        assert_eq!(opened.trailer(), Some(&[0x5A; TRAILER_LEN][..]));
    }

    #[test]
    fn new_checked_rejects_short_buffers() {
        assert!(Frame::new_checked(vec![0u8; 10]).is_err());
        assert!(Frame::new_checked(&ecm().as_bytes()[..23]).is_err());
        assert!(Frame::new_checked(ecm().as_bytes()).is_ok());
    }

    proptest! {
        #[test]
        fn plain_length_follows_declared_length(
            command in prop_oneof![Just(0u8), Just(1), Just(3), Just(4), Just(6)],
            body in proptest::collection::vec(any::<u8>(), 0..=255),
        ) {
            let cmd = Command::from_u8(command).unwrap();
            let mut frame = Frame::with_len(cmd, body.len() as u8);
            frame.set_body(&body);

            let trailer = if command == 3 || command == 4 { TRAILER_LEN } else { 0 };
            prop_assert_eq!(frame.as_bytes().len(), boundary(4, body.len() + 20 + trailer));

            let opened = open(&seal(&frame, &credential()), &mut credential()).unwrap();
            prop_assert_eq!(opened.as_bytes().len(), boundary(4, body.len() + 20 + trailer));
            prop_assert_eq!(opened.body(), &body[..]);
        }

        #[test]
        fn corrupting_the_body_fails_checksum(
            body in proptest::collection::vec(any::<u8>(), 1..=64),
            at in any::<prop::sample::Index>(),
            flip in 1u8..,
        ) {
            let mut frame = Frame::with_len(Command::Ecm, body.len() as u8);
            frame.set_body(&body);
            let sealed = seal(&frame, &credential());

            // Corrupt the plain body, then seal again without updating the CRC.
            let mut plain = sealed[4..].to_vec();
            credential().cipher().decrypt(&mut plain);
            plain[HEADER_LEN + at.index(body.len())] ^= flip;
            credential().cipher().encrypt(&mut plain);
            let mut raw = sealed[..4].to_vec();
            raw.extend_from_slice(&plain);

            prop_assert_eq!(open(&raw, &mut credential()).err(), Some(RelayError::ChecksumError));
        }
    }
}
