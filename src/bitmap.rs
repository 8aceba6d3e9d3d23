use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// fixed-size bitmap collecting the activations of the next level.
/// Bit sets are atomic at word granularity; reading happens only at the
/// level barrier, after all writers have quiesced.
pub struct AtomicBitmap {
    words: Vec<AtomicU64>,
    num_bits: usize,
}

impl AtomicBitmap {
    /// bitmap with `num_bits` clear bits
    pub fn new(num_bits: usize) -> Self {
        let num_words = (num_bits + WORD_BITS - 1) / WORD_BITS;
        Self {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
        }
    }

    /// set bit `off`; returns whether the bit was newly set
    pub fn set(&self, off: usize) -> bool {
        debug_assert!(off < self.num_bits);
        let mask = 1u64 << (off % WORD_BITS);
        let prev = self.words[off / WORD_BITS].fetch_or(mask, Ordering::SeqCst);
        prev & mask == 0
    }

    /// clear every bit
    pub fn clear_all(&self) {
        for w in &self.words {
            w.store(0, Ordering::SeqCst);
        }
    }

    /// append the offsets of all set bits to `out`, ascending
    pub fn get_set_bits(&self, out: &mut Vec<usize>) {
        for (wi, w) in self.words.iter().enumerate() {
            let mut bits = w.load(Ordering::SeqCst);
            while bits != 0 {
                out.push(wi * WORD_BITS + bits.trailing_zeros() as usize);
                bits &= bits - 1;
            }
        }
    }

    /// capacity in bits
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// whether the bitmap has zero capacity
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bits_come_back_ascending() {
        let map = AtomicBitmap::new(200);
        for off in [199, 0, 63, 64, 65, 3] {
            assert!(map.set(off));
        }
        assert!(!map.set(64));
        let mut out = Vec::new();
        map.get_set_bits(&mut out);
        assert_eq!(out, vec![0, 3, 63, 64, 65, 199]);
    }

    #[test]
    fn clear_all_resets() {
        let map = AtomicBitmap::new(70);
        map.set(1);
        map.set(69);
        map.clear_all();
        let mut out = Vec::new();
        map.get_set_bits(&mut out);
        assert!(out.is_empty());
        assert!(map.set(69));
    }
}
