use relay_core::{EcmRequest, ReadBe, Registry, RelayError, RelayResult};

use crate::constants::ELIGIBLE_HOP;

/**
    A card advertised by the server.

    Providers and failed services are kept in their own registries so that
    they can be edited while a routing scan holds the card list.
*/
#[derive(Debug)]
pub struct Card {
    pub id: u32,
    pub caid: u16,
    pub hop: u8,
    pub serial: [u8; 8],
    providers: Registry<[u8; 3]>,
    failed_services: Registry<u16>,
}

impl Card {
    /// Fixed part of a card advertisement, up to and including the provider count.
    pub const HEADER_LEN: usize = 21;
    /// Each provider entry: 3-byte id followed by 4 bytes of shared address.
    pub const PROVIDER_STRIDE: usize = 7;

    pub fn new(id: u32, caid: u16, hop: u8) -> Self {
        Self {
            id,
            caid,
            hop,
            serial: [0; 8],
            providers: Registry::new(),
            failed_services: Registry::new(),
        }
    }

    /**
        Parse a card advertisement body.

        Layout:
          [0..4]    card id
          [4..8]    remote id (unused)
          [8..10]   caid
          [10]      hop
          [11]      reshare (unused)
          [12..20]  serial
          [20]      provider count
          [21..]    providers, 7 bytes each
    */
    pub fn parse(body: &[u8]) -> RelayResult<Self> {
        if body.len() < Self::HEADER_LEN {
            return Err(RelayError::ShortRead {
                expected: Self::HEADER_LEN,
                actual: body.len(),
            });
        }

        let count = body[20] as usize;
        let needed = Self::HEADER_LEN + count * Self::PROVIDER_STRIDE;
        if body.len() < needed {
            return Err(RelayError::ShortRead {
                expected: needed,
                actual: body.len(),
            });
        }

        let mut card = Self::new(body.u32_at(0), body.u16_at(8), body[10]);
        card.serial.copy_from_slice(&body[12..20]);
        for i in 0..count {
            let at = Self::HEADER_LEN + i * Self::PROVIDER_STRIDE;
            card.add_provider([body[at], body[at + 1], body[at + 2]]);
        }
        Ok(card)
    }

    pub fn add_provider(&self, provider: [u8; 3]) {
        self.providers.append(provider);
    }

    pub fn providers(&self) -> Vec<u32> {
        self.providers
            .snapshot()
            .into_iter()
            .map(|p| p.as_slice().u24_at(0))
            .collect()
    }

    /**
        Returns `true` if the card lists `provider_id` (low 24 bits compared).
    */
    pub fn serves(&self, provider_id: u32) -> bool {
        let wanted = provider_id & 0x00FF_FFFF;
        self.providers
            .any(|p| p.as_slice().u24_at(0) == wanted)
    }

    pub fn has_failed(&self, service_id: u16) -> bool {
        self.failed_services.any(|&sid| sid == service_id)
    }

    pub fn mark_failed(&self, service_id: u16) {
        if !self.has_failed(service_id) {
            self.failed_services.append(service_id);
        }
    }
}

/**
    Where an ECM request is sent.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub card_id: u32,
    pub caid: u16,
    pub hop: u8,
}

/**
    Pick the first card, in registry order, that can answer `request`:
    same caid, hop 0, lists the provider and has not failed the service.
*/
pub fn select_card(cards: &Registry<Card>, request: &EcmRequest) -> Option<Route> {
    let mut cursor = cards.cursor();
    while let Some(card) = cursor.current() {
        if card.caid == request.caid
            && card.hop == ELIGIBLE_HOP
            && card.serves(request.provider_id)
            && !card.has_failed(request.service_id)
        {
            return Some(Route {
                card_id: card.id,
                caid: card.caid,
                hop: card.hop,
            });
        }
        cursor.advance();
    }
    None
}

/**
    Remove the card with the given id. Returns the removed card, if any.
*/
pub fn remove_card(cards: &Registry<Card>, card_id: u32) -> Option<Card> {
    let mut cursor = cards.cursor();
    while let Some(card) = cursor.current() {
        if card.id == card_id {
            return cursor.remove();
        }
        cursor.advance();
    }
    None
}

/**
    Run `f` on the card with the given id.
*/
pub fn with_card<R>(cards: &Registry<Card>, card_id: u32, f: impl FnOnce(&Card) -> R) -> Option<R> {
    let mut cursor = cards.cursor();
    while let Some(card) = cursor.current() {
        if card.id == card_id {
            return Some(f(card));
        }
        cursor.advance();
    }
    None
}
