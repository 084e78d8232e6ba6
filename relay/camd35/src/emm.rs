use std::time::{Duration, Instant};

use relay_core::{CardInfo, EmmFilter, ProviderInfo, ReadBe, RelayError, RelayResult};

use crate::frame::{Command, Frame, HEADER_LEN};

/// Body length understood by camd3 3.890 and later.
pub const EMM_REQUEST_LEN: u8 = 111;
/// Body length expected by older camd3 releases.
pub const EMM_REQUEST_LEN_LEGACY: u8 = 112;
/// The same card is advertised at most once in this window.
pub const PROVISIONING_INTERVAL: Duration = Duration::from_secs(180);
/// Consecutive "no card" advertisements sent before going quiet.
const MAX_DISABLE_FRAMES: u8 = 3;
/// Provider entries that fit before the EMM flags at offset 128.
const MAX_PROVIDERS: usize = 16;

const CAID_AT: usize = HEADER_LEN;
const CAID_COUNT_AT: usize = 39;
const SERIAL_AT: usize = 40;
const PROVIDER_COUNT_AT: usize = 47;
const PROVIDERS_AT: usize = 48;
const PROVIDER_STRIDE: usize = 5;
const FLAGS_AT: usize = 128;

/**
    Betacrypt and Irdeto carry the full provider id; every other system
    carries the low two bytes followed by the shared address.
*/
fn has_long_provider_id(caid: u16) -> bool {
    matches!(caid, 0x1700..=0x1799 | 0x0600..=0x0699)
}

/**
    Build the card data frame (CMD05) sent after an answer.

    Layout (frame offsets):
      [2..4]      0xFF 0xFF
      [8..10]     service id of the answered request
      [10..12]    caid (copy of [20..22])
      [12..16]    provider id
      [16..18]    pid
      [20..22]    caid
      [39]        number of caids (1)
      [40..46]    serial
      [47]        number of providers
      [48..]      providers, 5 bytes each
      [128..131]  global / shared / unique EMM accepted

    A frame for a reader without a card carries only the disable markers
    (bytes 20, 39, 40, 47 and 49 set to 1).
*/
pub fn build_emm_request(card: &CardInfo, service_id: u16, provider_id: u32, pid: u16) -> Frame {
    let mut frame = Frame::with_len(Command::EmmRequest, EMM_REQUEST_LEN_LEGACY);
    frame.raw_mut()[HEADER_LEN..].fill(0);
    frame.set_len(EMM_REQUEST_LEN);
    frame.set_service_id(service_id);
    frame.set_provider_id(provider_id);
    frame.set_index(pid);

    let buf = frame.raw_mut();
    buf[2] = 0xFF;
    buf[3] = 0xFF;

    if card.has_card() {
        buf[CAID_COUNT_AT] = 1;
        buf[CAID_AT..CAID_AT + 2].copy_from_slice(&card.caid.to_be_bytes());
        buf[SERIAL_AT..SERIAL_AT + 6].copy_from_slice(&card.serial[..6]);

        let count = card.providers.len().min(MAX_PROVIDERS);
        buf[PROVIDER_COUNT_AT] = count as u8;
        for (i, provider) in card.providers.iter().take(count).enumerate() {
            let at = PROVIDERS_AT + i * PROVIDER_STRIDE;
            if has_long_provider_id(card.caid) {
                buf[at] = provider.id[0];
                buf[at + 2..at + 5].copy_from_slice(&provider.id[1..]);
            } else {
                buf[at] = provider.id[2];
                buf[at + 1] = provider.id[3];
                buf[at + 2..at + 6].copy_from_slice(&provider.sa);
            }
        }

        buf[FLAGS_AT] = card.emm.global as u8;
        buf[FLAGS_AT + 1] = card.emm.shared as u8;
        buf[FLAGS_AT + 2] = card.emm.unique as u8;
    } else {
        for at in [CAID_AT, CAID_COUNT_AT, SERIAL_AT, PROVIDER_COUNT_AT, 49] {
            buf[at] = 1;
        }
    }

    buf.copy_within(CAID_AT..CAID_AT + 2, 10);
    frame
}

/**
    Read the card data out of a CMD05 frame.
*/
pub fn parse_emm_request<B: AsRef<[u8]>>(frame: &Frame<B>) -> RelayResult<CardInfo> {
    let buf = frame.as_bytes();
    if frame.len() < EMM_REQUEST_LEN || buf.len() < FLAGS_AT + 3 {
        return Err(RelayError::ShortRead {
            expected: HEADER_LEN + EMM_REQUEST_LEN as usize,
            actual: buf.len(),
        });
    }

    let caid = buf.u16_at(CAID_AT);
    let count = (buf[PROVIDER_COUNT_AT] as usize).min(MAX_PROVIDERS);
    let providers = (0..count)
        .map(|i| {
            let at = PROVIDERS_AT + i * PROVIDER_STRIDE;
            let mut provider = ProviderInfo::default();
            if has_long_provider_id(caid) {
                provider.id[0] = buf[at];
                provider.id[1..].copy_from_slice(&buf[at + 2..at + 5]);
            } else {
                provider.id[2] = buf[at];
                provider.id[3] = buf[at + 1];
                provider.sa.copy_from_slice(&buf[at + 2..at + 6]);
            }
            provider
        })
        .collect();

    let mut serial = [0u8; 8];
    serial[..6].copy_from_slice(&buf[SERIAL_AT..SERIAL_AT + 6]);

    Ok(CardInfo {
        caid,
        serial,
        providers,
        emm: EmmFilter {
            global: buf[FLAGS_AT] == 1,
            shared: buf[FLAGS_AT + 1] == 1,
            unique: buf[FLAGS_AT + 2] == 1,
        },
    })
}

/**
    Decides whether card data is due for a peer.

    The same serial is not repeated within [`PROVISIONING_INTERVAL`]. A
    reader without a card is announced at most three times in a row.
*/
#[derive(Debug, Default)]
pub struct EmmThrottle {
    last: Option<([u8; 8], Instant)>,
    disable_frames: u8,
}

impl EmmThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, card: &CardInfo, now: Instant) -> bool {
        if let Some((serial, at)) = self.last
            && serial == card.serial
            && now.saturating_duration_since(at) < PROVISIONING_INTERVAL
        {
            return false;
        }
        self.last = Some((card.serial, now));

        if card.has_card() {
            self.disable_frames = 0;
            return true;
        }
        if self.disable_frames >= MAX_DISABLE_FRAMES {
            return false;
        }
        self.disable_frames += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn card(caid: u16) -> CardInfo {
        CardInfo {
            caid,
            serial: hex!("0102030405060000"),
            providers: vec![
                ProviderInfo {
                    id: hex!("00000A0B"),
                    sa: hex!("11223344"),
                },
                ProviderInfo {
                    id: hex!("0001C2D3"),
                    sa: hex!("55667788"),
                },
            ],
            emm: EmmFilter {
                global: true,
                shared: false,
                unique: true,
            },
        }
    }

    #[test]
    fn card_frame_layout() {
        let frame = build_emm_request(&card(0x0500), 0x0101, 0x00000A0B, 0x0222);
        let buf = frame.as_bytes();
        assert_eq!(frame.command(), 0x05);
        assert_eq!(frame.len(), 111);
        assert_eq!(buf.len(), 132);
        assert_eq!(&buf[2..4], &[0xFF, 0xFF]);
        assert_eq!(frame.service_id(), 0x0101);
        assert_eq!(frame.caid(), 0x0500);
        assert_eq!(frame.provider_id(), 0x00000A0B);
        assert_eq!(frame.index(), 0x0222);
        assert_eq!(&buf[20..22], &[0x05, 0x00]);
        assert_eq!(buf[39], 1);
        assert_eq!(&buf[40..46], &hex!("010203040506"));
        assert_eq!(buf[47], 2);
        // Second provider overwrites the last SA byte of the first.
        assert_eq!(&buf[48..53], &hex!("0A0B112233"));
        assert_eq!(&buf[53..59], &hex!("C2D355667788"));
        assert_eq!(&buf[128..131], &[1, 0, 1]);
    }

    #[test]
    fn long_provider_ids() {
        let frame = build_emm_request(&card(0x0604), 0, 0, 0);
        let buf = frame.as_bytes();
        assert_eq!(&buf[48..53], &hex!("0000000A0B"));
        assert_eq!(&buf[53..58], &hex!("000001C2D3"));

        let parsed = parse_emm_request(&frame).unwrap();
        assert_eq!(parsed.providers[1].id, hex!("0001C2D3"));
    }

    #[test]
    fn no_card_markers() {
        let frame = build_emm_request(&CardInfo::default(), 0x0101, 0, 0);
        let buf = frame.as_bytes();
        for at in [20, 39, 40, 47, 49] {
            assert_eq!(buf[at], 1, "offset {at}");
        }
        assert_eq!(&buf[10..12], &[0x01, 0x00]);
        assert_eq!(buf[48], 0);
    }

    #[test]
    fn parse_short_provider_ids() {
        let frame = build_emm_request(&card(0x0500), 0x0101, 0, 0);
        let parsed = parse_emm_request(&frame).unwrap();
        assert_eq!(parsed.caid, 0x0500);
        assert_eq!(parsed.serial, hex!("0102030405060000"));
        assert_eq!(parsed.providers.len(), 2);
        assert_eq!(parsed.providers[1].id, hex!("0000C2D3"));
        assert_eq!(parsed.providers[1].sa, hex!("55667788"));
        assert!(parsed.emm.global && !parsed.emm.shared && parsed.emm.unique);
    }

    #[test]
    fn throttle_same_serial() {
        let mut throttle = EmmThrottle::new();
        let card = card(0x0500);
        let start = Instant::now();
        assert!(throttle.admit(&card, start));
        assert!(!throttle.admit(&card, start + Duration::from_secs(179)));
        assert!(throttle.admit(&card, start + Duration::from_secs(180)));

        let mut other = card.clone();
        other.serial[0] = 0xFF;
        assert!(throttle.admit(&other, start + Duration::from_secs(181)));
    }

    #[test]
    fn throttle_disable_frames() {
        let mut throttle = EmmThrottle::new();
        let empty = CardInfo::default();
        let start = Instant::now();
        let admitted = (0..6)
            .filter(|i| throttle.admit(&empty, start + PROVISIONING_INTERVAL * *i))
            .count();
        assert_eq!(admitted, 3);

        assert!(throttle.admit(&card(0x0500), start));
        assert!(throttle.admit(&empty, start + Duration::from_secs(1)));
    }
}
