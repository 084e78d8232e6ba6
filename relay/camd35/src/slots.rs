use relay_core::utils::copy_truncated;

use crate::frame::{Frame, REQ_SIZE};

/**
    Fixed pool of request buffers, one per outstanding request.

    The pool belongs to whoever tracks requests; sessions only borrow a slot
    by index. A request is stored verbatim when it arrives and its buffer is
    later rewritten in place into the answer, so the routing fields written
    by the requester go back unchanged.
*/
pub struct RequestSlots {
    slots: Box<[[u8; REQ_SIZE]]>,
}

impl RequestSlots {
    /**
        Pool with `capacity` slots (at least one).
    */
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![[0u8; REQ_SIZE]; capacity.max(1)].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn position(&self, index: u16) -> usize {
        index as usize % self.slots.len()
    }

    /**
        Copy a plain request frame into the slot for `index`.
    */
    pub fn store(&mut self, index: u16, frame: &[u8]) -> Frame<&mut [u8]> {
        let at = self.position(index);
        let slot = &mut self.slots[at];
        slot.fill(0);
        copy_truncated(slot, frame);
        Frame::from_slot(&mut slot[..])
    }

    pub fn slot(&self, index: u16) -> Frame<&[u8]> {
        Frame::from_slot(&self.slots[self.position(index)][..])
    }

    pub fn slot_mut(&mut self, index: u16) -> Frame<&mut [u8]> {
        let at = self.position(index);
        Frame::from_slot(&mut self.slots[at][..])
    }
}

impl Default for RequestSlots {
    fn default() -> Self {
        Self::new(32)
    }
}

impl core::fmt::Debug for RequestSlots {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestSlots")
            .field("capacity", &self.capacity())
            .finish()
    }
}
