use core::fmt;

use sha1::{Digest, Sha1};

use crate::constants::{HANDSHAKE_TAG, SEED_LEN};

/**
    Direction of a [`CipherState::apply`] pass.

    Both directions XOR the same keystream; they differ only in which byte
    feeds the running state. Decrypt feeds the recovered plaintext, encrypt
    feeds the input plaintext, so a sender and a receiver that see the same
    plaintext stay in lockstep.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMode {
    Decrypt,
    Encrypt,
}

/**
    Keyed, stateful byte-permutation stream cipher (RC4 family) used for
    every byte exchanged after the seed.

    One instance is kept per direction and is never re-keyed.
*/
#[derive(Clone, PartialEq, Eq)]
pub struct CipherState {
    table: [u8; 256],
    state: u8,
    counter: u8,
    sum: u8,
}

impl CipherState {
    /**
        Run the key schedule over `key`, cycling through it as needed.
        An empty key is treated as a single zero byte.
    */
    pub fn new(key: &[u8]) -> Self {
        let key: &[u8] = if key.is_empty() { &[0] } else { key };

        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8;
        }

        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(key[i % key.len()]).wrapping_add(table[i]);
            table.swap(i, j as usize);
        }

        Self {
            table,
            state: key[0],
            counter: 0,
            sum: 0,
        }
    }

    /**
        Transform `data` in place.
    */
    pub fn apply(&mut self, data: &mut [u8], mode: CryptMode) {
        for byte in data.iter_mut() {
            self.counter = self.counter.wrapping_add(1);
            self.sum = self.sum.wrapping_add(self.table[self.counter as usize]);
            self.table.swap(self.counter as usize, self.sum as usize);

            let input = *byte;
            let at = self.table[self.counter as usize].wrapping_add(self.table[self.sum as usize]);
            let k = self.table[at as usize];
            *byte = input ^ k ^ self.state;

            let feed = match mode {
                CryptMode::Decrypt => *byte,
                CryptMode::Encrypt => input,
            };
            self.state ^= feed;
        }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.apply(data, CryptMode::Encrypt);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.apply(data, CryptMode::Decrypt);
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("counter", &self.counter)
            .field("sum", &self.sum)
            .finish_non_exhaustive()
    }
}

/**
    Cipher pair and hash produced from the server seed.
*/
#[derive(Debug, Clone)]
pub struct HandshakeKeys {
    /// Inbound direction (keyed by the seed digest).
    pub recv: CipherState,
    /// Outbound direction (keyed by the decrypted seed).
    pub send: CipherState,
    /// Seed digest after the outbound pre-pass; written to the server next.
    pub digest: [u8; 20],
}

/**
    Mask the 16-byte server seed before hashing: the upper half is replaced by
    `i * seed[i]` and the first bytes are XORed with the handshake tag.
*/
pub fn mask_seed(seed: &mut [u8; SEED_LEN]) {
    for i in 0..8 {
        seed[8 + i] = (i as u8).wrapping_mul(seed[i]);
        if i < HANDSHAKE_TAG.len() {
            seed[i] ^= HANDSHAKE_TAG[i];
        }
    }
}

/**
    Derive both ciphers from the raw server seed.

    The ordering is fixed by the protocol:
      1. mask the seed and SHA-1 it,
      2. key `recv` with the digest and decrypt the masked seed with it,
      3. key `send` with that decrypted seed,
      4. pass the digest through `send` in decrypt mode.
*/
pub fn derive_keys(seed: &[u8; SEED_LEN]) -> HandshakeKeys {
    let mut masked = *seed;
    mask_seed(&mut masked);

    let mut digest: [u8; 20] = Sha1::digest(masked).into();

    let mut recv = CipherState::new(&digest);
    recv.decrypt(&mut masked);

    let mut send = CipherState::new(&masked);
    send.apply(&mut digest, CryptMode::Decrypt);

    HandshakeKeys { recv, send, digest }
}

/**
    Undo the per-card scrambling of a control word.

    Each byte is XORed with the low byte of a 64-bit window over the local
    node id (inverted on odd positions) and with the low byte of the card id.
    After every byte the window shifts right by 4 bits and the card id by 2.
*/
pub fn decode_cw(cw: &mut [u8; 16], node_id: &[u8; 8], card_id: u32) {
    let mut hi = u32::from_be_bytes([node_id[0], node_id[1], node_id[2], node_id[3]]);
    let mut lo = u32::from_be_bytes([node_id[4], node_id[5], node_id[6], node_id[7]]);
    let mut card = card_id;

    for (i, byte) in cw.iter_mut().enumerate() {
        let mut t = *byte ^ lo as u8;
        if i & 1 == 1 {
            t = !t;
        }
        *byte = t ^ card as u8;

        lo = (lo >> 4) | (hi << 28);
        hi >>= 4;
        card >>= 2;
    }
}
