//! Fixed-size free/used bitmap backing the NAT slot allocator.

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    words: Vec<u64>,
    size: u32,
    used: u32,
}

impl BitmapAllocator {
    pub fn new(size: u32) -> Self {
        let words = vec![0u64; (size as usize + 63) / 64];
        BitmapAllocator {
            words,
            size,
            used: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    /// Claim the lowest free slot.
    pub fn get(&mut self) -> Result<u32> {
        for (wi, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let idx = wi as u32 * 64 + bit;
            if idx >= self.size {
                break;
            }
            *word |= 1u64 << bit;
            self.used += 1;
            return Ok(idx);
        }
        Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            format!("all {} slots in use", self.size),
        ))
    }

    /// Release a previously claimed slot.
    pub fn put(&mut self, idx: u32) -> Result<()> {
        if idx >= self.size {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("slot {} outside [0, {})", idx, self.size),
            ));
        }
        let (wi, bit) = (idx as usize / 64, idx % 64);
        if self.words[wi] & (1u64 << bit) == 0 {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("slot {} is not allocated", idx),
            ));
        }
        self.words[wi] &= !(1u64 << bit);
        self.used -= 1;
        Ok(())
    }

    pub fn is_free(&self, idx: u32) -> bool {
        idx < self.size && self.words[idx as usize / 64] & (1u64 << (idx % 64)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free() {
        let mut b = BitmapAllocator::new(3);
        assert_eq!(b.get().unwrap(), 0);
        assert_eq!(b.get().unwrap(), 1);
        assert_eq!(b.get().unwrap(), 2);
        assert_eq!(
            b.get().unwrap_err().kind,
            crate::error::ErrorKind::ResourceNotAvailable
        );

        b.put(1).unwrap();
        assert_eq!(b.get().unwrap(), 1);
    }

    #[test]
    fn put_validates() {
        let mut b = BitmapAllocator::new(8);
        assert!(b.put(0).is_err());
        assert!(b.put(100).is_err());
        let s = b.get().unwrap();
        b.put(s).unwrap();
        assert!(b.is_free(s));
    }

    #[test]
    fn randomized_get_put_keeps_lowest_free() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut b = BitmapAllocator::new(64);
        let mut live: Vec<u32> = Vec::new();

        for _ in 0..1000 {
            if live.is_empty() || (live.len() < 64 && rng.gen_bool(0.6)) {
                let slot = b.get().unwrap();
                // The allocator always hands out the lowest free slot.
                assert!((0..slot).all(|s| live.contains(&s)));
                live.push(slot);
            } else {
                let slot = live.swap_remove(rng.gen_range(0..live.len()));
                b.put(slot).unwrap();
            }
            assert_eq!(b.used() as usize, live.len());
        }
    }

    #[test]
    fn crosses_word_boundary() {
        let mut b = BitmapAllocator::new(130);
        for i in 0..130 {
            assert_eq!(b.get().unwrap(), i);
        }
        assert!(b.get().is_err());
        b.put(64).unwrap();
        b.put(129).unwrap();
        assert_eq!(b.get().unwrap(), 64);
        assert_eq!(b.get().unwrap(), 129);
        assert_eq!(b.used(), 130);
    }
}
