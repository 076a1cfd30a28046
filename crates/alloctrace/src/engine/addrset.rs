//! Open-addressed set of instruction addresses.
//!
//! The reporter uses one per dump as a cache of frames already classified
//! as not matching the output filter. The set never grows: once full it
//! stops admitting new members and every further lookup of an unseen
//! address misses, which only costs re-symbolization.

const MAX_LOAD_PERCENT: usize = 70;

pub struct AddrSet {
    slots: Vec<usize>,
    mask: usize,
    len: usize,
    full: bool,
}

impl AddrSet {
    pub fn new(capacity: usize) -> AddrSet {
        let slots = capacity.next_power_of_two().max(64);
        AddrSet {
            slots: vec![0; slots],
            mask: slots - 1,
            len: 0,
            full: false,
        }
    }

    #[inline]
    fn probe(&self, addr: usize) -> Option<usize> {
        let mut idx = addr.wrapping_mul(0x9e37_79b9_7f4a_7c15) & self.mask;
        loop {
            match self.slots[idx] {
                0 => return Some(idx),
                slot if slot == addr => return None,
                _ => idx = (idx + 1) & self.mask,
            }
        }
    }

    /// Add `addr`; returns false if it was already present or the set is
    /// full. Address zero cannot be stored and always reads as absent.
    pub fn insert(&mut self, addr: usize) -> bool {
        if addr == 0 || self.full {
            return false;
        }
        match self.probe(addr) {
            Some(idx) => {
                self.slots[idx] = addr;
                self.len += 1;
                if self.len * 100 >= self.slots.len() * MAX_LOAD_PERCENT {
                    self.full = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr != 0 && self.probe(addr).is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
