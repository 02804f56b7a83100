//! # Bit Maps
//!
//! Single-bit access into packed byte arrays. Bit `i` lives in byte `i / 8`
//! as `1 << (i % 8)`, the same order used on the wire and in flash headers.

/// Test bit `bit` of a packed byte array
pub fn get_bit(bytes: &[u8], bit: usize) -> bool {
    bytes[bit / 8] & (1 << (bit % 8)) != 0
}

/// Set bit `bit` of a packed byte array
pub fn set_bit(bytes: &mut [u8], bit: usize) {
    bytes[bit / 8] |= 1 << (bit % 8);
}

/// Clear bit `bit` of a packed byte array
pub fn clear_bit(bytes: &mut [u8], bit: usize) {
    bytes[bit / 8] &= !(1 << (bit % 8));
}

/// Fixed-size bitset backed by `N` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> Bitmap<N> {
    /// Number of addressable bits
    pub const BITS: usize = N * 8;

    /// Create a bitmap with every bit cleared
    pub const fn new() -> Self {
        Self { bytes: [0; N] }
    }

    /// Wrap raw bytes (e.g. taken from a received packet)
    pub const fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    /// Raw packed bytes
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Test a bit
    ///
    /// # Panics
    ///
    /// Panics if `bit` is out of range.
    pub fn get(&self, bit: usize) -> bool {
        assert!(bit < Self::BITS, "bit {} out of range (max {})", bit, Self::BITS);
        get_bit(&self.bytes, bit)
    }

    /// Set a bit
    ///
    /// # Panics
    ///
    /// Panics if `bit` is out of range.
    pub fn set(&mut self, bit: usize) {
        assert!(bit < Self::BITS, "bit {} out of range (max {})", bit, Self::BITS);
        set_bit(&mut self.bytes, bit);
    }

    /// Clear a bit
    ///
    /// # Panics
    ///
    /// Panics if `bit` is out of range.
    pub fn clear(&mut self, bit: usize) {
        assert!(bit < Self::BITS, "bit {} out of range (max {})", bit, Self::BITS);
        clear_bit(&mut self.bytes, bit);
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of the set bits in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..Self::BITS).filter(move |&bit| get_bit(&self.bytes, bit))
    }
}

impl<const N: usize> Default for Bitmap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// One bit per page fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentMask(pub u8);

impl FragmentMask {
    /// No fragments
    pub const EMPTY: FragmentMask = FragmentMask(0);

    /// Every fragment
    pub const ALL: FragmentMask = FragmentMask(0xFF);

    /// Mask with only fragment `fragment`
    pub fn single(fragment: usize) -> Self {
        assert!(fragment < 8, "fragment {} out of range", fragment);
        FragmentMask(1 << fragment)
    }

    pub fn contains(self, fragment: usize) -> bool {
        fragment < 8 && self.0 & (1 << fragment) != 0
    }

    pub fn insert(&mut self, fragment: usize) {
        assert!(fragment < 8, "fragment {} out of range", fragment);
        self.0 |= 1 << fragment;
    }

    pub fn remove(&mut self, fragment: usize) {
        assert!(fragment < 8, "fragment {} out of range", fragment);
        self.0 &= !(1 << fragment);
    }

    pub fn complement(self) -> Self {
        FragmentMask(!self.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest fragment index in the mask
    pub fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Fragment indices in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..8).filter(move |&f| self.contains(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order_within_byte() {
        let mut bytes = [0u8; 2];
        set_bit(&mut bytes, 0);
        set_bit(&mut bytes, 9);
        assert_eq!(bytes, [0x01, 0x02]);
        assert!(get_bit(&bytes, 9));
        assert!(!get_bit(&bytes, 8));

        clear_bit(&mut bytes, 0);
        assert_eq!(bytes, [0x00, 0x02]);
    }

    #[test]
    fn test_bitmap_set_clear_count() {
        let mut map = Bitmap::<4>::new();
        assert_eq!(Bitmap::<4>::BITS, 32);
        map.set(3);
        map.set(31);
        assert_eq!(map.count_ones(), 2);
        assert_eq!(map.iter_ones().collect::<Vec<_>>(), vec![3, 31]);
        map.clear(3);
        assert!(!map.get(3));
        assert_eq!(map.as_bytes(), &[0, 0, 0, 0x80]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bitmap_out_of_range_panics() {
        let map = Bitmap::<1>::new();
        map.get(8);
    }

    #[test]
    fn test_fragment_mask_complement() {
        // Header of a page with fragments 0 and 1 committed
        let unused = FragmentMask(0xFC);
        let wanted = unused.complement();
        assert_eq!(wanted, FragmentMask(0x03));
        assert_eq!(wanted.count(), 2);
        assert_eq!(wanted.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(wanted.lowest(), Some(0));
    }

    #[test]
    fn test_fragment_mask_insert_remove() {
        let mut mask = FragmentMask::EMPTY;
        mask.insert(7);
        mask.insert(2);
        assert!(mask.contains(7));
        mask.remove(7);
        assert_eq!(mask, FragmentMask::single(2));
        assert!(!mask.contains(8));
        assert_eq!(FragmentMask::EMPTY.lowest(), None);
    }
}
