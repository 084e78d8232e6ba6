use std::time::{SystemTime, UNIX_EPOCH};

/**
    Linear-congruential byte generator used for the client node id.

    The node id only has to differ between clients sharing a server; it is
    not a secret, so a clock-seeded LCG is what peers expect.
*/
#[derive(Debug, Clone)]
pub struct NodeIdGenerator {
    seed: u32,
}

impl NodeIdGenerator {
    pub const fn new(seed: u32) -> Self {
        Self { seed }
    }

    /**
        Seed from the current wall-clock time (seconds since the epoch).
    */
    pub fn from_clock() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::new(secs as u32)
    }

    pub fn next_byte(&mut self) -> u8 {
        self.seed = self.seed.wrapping_mul(4079).wrapping_add(12923);
        (self.seed % 0xFF) as u8
    }

    pub fn node_id(&mut self) -> [u8; 8] {
        core::array::from_fn(|_| self.next_byte())
    }
}
