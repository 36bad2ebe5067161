//! A very simple u4/nibble implementation.

/// Represents an unsigned 4-bit value (nibble) encoded as a byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct U4(u8);

impl U4 {
    /// Constructs a nibble from the 4 low/rightmost bits of a byte.
    pub fn from_lo(raw: u8) -> Self {
        Self(raw & 0x0f)
    }

    /// Constructs a nibble from the 4 high/leftmost bits of a byte.
    pub fn from_hi(raw: u8) -> Self {
        Self(raw >> 4)
    }

    /// Constructs a byte with the nibble set as the 4 low/rightmost bits.
    pub fn to_lo(self) -> u8 {
        self.0
    }

    /// Constructs a byte with the nibble set as the 4 high/leftmost bits.
    pub fn to_hi(self) -> u8 {
        self.0 << 4
    }

    /// Combines two nibbles to a byte, with `hi` being set to the 4 leftmost
    /// and `lo` being set to the 4 rightmost bits.
    pub fn combine(hi: Self, lo: Self) -> u8 {
        hi.to_hi() | lo.to_lo()
    }
}

#[cfg(test)]
mod tests {
    use super::U4;

    #[test]
    fn combine_places_nibbles() {
        assert_eq!(U4::combine(U4::from_lo(0x1), U4::from_lo(0xf)), 0x1f);
        assert_eq!(U4::from_hi(0xa5), U4::from_lo(0x0a));
        assert_eq!(U4::from_lo(0xa5).to_hi(), 0x50);
    }
}
