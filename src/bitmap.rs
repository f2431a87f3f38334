use alloc::{vec, vec::Vec};

/// A fixed-length bitmap.
///
/// The page table keeps one bit per level-0 granule; a set bit means the
/// granule's table page has been wired.
pub struct Bitmap {
    num_bits: usize,
    map: Vec<u64>,
}

impl Bitmap {
    /// Constructs a new bitmap of `num_bits` bits, all clear.
    pub fn new(num_bits: usize) -> Bitmap {
        assert!(num_bits > 0);

        Bitmap {
            num_bits,
            map: vec![0; Self::num_blocks(num_bits)],
        }
    }

    /// Returns the number of `u64` blocks needed to hold `num_bits` bits.
    #[inline]
    pub const fn num_blocks(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    /// Returns the number of bits in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);
        self.map[block_idx] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);
        let block = &mut self.map[block_idx];
        *block = match value {
            true => *block | mask,
            false => *block & !mask,
        };
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.map.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns an iterator over the indices of all set bits, in order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.map
            .iter()
            .enumerate()
            .flat_map(|(block_idx, &block)| {
                let base = block_idx * u64::BITS as usize;
                (0..u64::BITS as usize)
                    .filter(move |bit| block & (1 << bit) != 0)
                    .map(move |bit| base + bit)
            })
            .filter(|&bit| bit < self.num_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let b = Bitmap::new(num_bits);
            assert_eq!(b.len(), num_bits);
            assert_eq!(b.count_ones(), 0);
        }
    }

    #[test]
    fn set_clear_iter() {
        let mut b = Bitmap::new(130);
        b.set(0, true);
        b.set(64, true);
        b.set(129, true);
        b.set(64, false);

        assert!(b.get(0));
        assert!(!b.get(64));
        assert!(b.get(129));
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![0, 129]);
        assert_eq!(b.count_ones(), 2);
    }
}
