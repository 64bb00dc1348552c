use core::{
    alloc::{Layout, LayoutError},
    mem,
};

/// A fixed-length bitmap backed by externally owned storage.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of the storage required for `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Result<Layout, LayoutError> {
        Layout::array::<u64>(Self::num_words(num_bits))
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with every
    /// bit cleared.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::map_layout(num_bits).size()` bytes, and it must be properly
    ///   aligned.
    /// - `map` must not be accessed other than through the returned `Bitmap`
    ///   for as long as it exists.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        for i in 0..Self::num_words(num_bits) {
            unsafe { map.add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    /// Returns the number of `u64` words needed to hold `num_bits` bits.
    #[inline]
    pub const fn num_words(num_bits: usize) -> usize {
        num_bits / u64::BITS as usize + (num_bits % u64::BITS as usize != 0) as usize
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

        let (word, mask) = Self::index_and_mask(index);

        // SAFETY: `word` is in bounds because `index < num_bits`.
        unsafe { self.map.add(word).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        // SAFETY: `word` is in bounds because `index < num_bits`.
        unsafe {
            let word_ptr = self.map.add(word);
            let bits = word_ptr.read();
            word_ptr.write(match value {
                true => bits | mask,
                false => bits & !mask,
            });
        }
    }

    /// Returns `true` if any bit is set.
    pub fn any(&self) -> bool {
        // Bits past `num_bits` are never set, so whole words can be tested.
        (0..Self::num_words(self.num_bits)).any(|i| unsafe { self.map.add(i).read() } != 0)
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    pub fn count_ones(&self) -> usize {
        (0..Self::num_words(self.num_bits))
            .map(|i| unsafe { self.map.add(i).read() }.count_ones() as usize)
            .sum()
    }
}
