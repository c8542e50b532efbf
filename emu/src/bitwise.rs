use std::ops::RangeInclusive;

/// Contains some helper methods to manipulate bits,
/// the index (`bit_idx`) is supposed to be from lsb to msb (right to left)
pub trait Bits: Copy {
    const WIDTH: u8;

    fn get_bit(self, bit_idx: u8) -> bool;

    fn set_bit(&mut self, bit_idx: u8, value: bool);

    /// Extracts the bits in `bits_range` and moves them to position 0.
    fn get_bits(self, bits_range: RangeInclusive<u8>) -> Self;

    /// Replaces the bits in `bits_range` with the low bits of `value`.
    fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self);

    fn are_bits_on(self, bits_range: RangeInclusive<u8>) -> bool;

    fn get_byte(self, byte_nth: u8) -> u8;

    fn set_byte(&mut self, byte_nth: u8, value: u8);
}

macro_rules! impl_bits {
    ($($t:ty),*) => {
        $(
            impl Bits for $t {
                const WIDTH: u8 = <$t>::BITS as u8;

                fn get_bit(self, bit_idx: u8) -> bool {
                    debug_assert!(bit_idx < Self::WIDTH);
                    (self >> bit_idx) & 1 == 1
                }

                fn set_bit(&mut self, bit_idx: u8, value: bool) {
                    debug_assert!(bit_idx < Self::WIDTH);
                    if value {
                        *self |= 1 << bit_idx;
                    } else {
                        *self &= !(1 << bit_idx);
                    }
                }

                fn get_bits(self, bits_range: RangeInclusive<u8>) -> Self {
                    let start = *bits_range.start();
                    let length = bits_range.len() as u32;
                    if length >= <$t>::BITS {
                        return self >> start;
                    }
                    (self >> start) & ((1 << length) - 1)
                }

                fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self) {
                    let start = *bits_range.start();
                    let length = bits_range.len() as u32;
                    let mask: Self = if length >= <$t>::BITS {
                        <$t>::MAX
                    } else {
                        (1 << length) - 1
                    };
                    *self = (*self & !(mask << start)) | ((value & mask) << start);
                }

                fn are_bits_on(self, bits_range: RangeInclusive<u8>) -> bool {
                    let length = bits_range.len() as u32;
                    let ones: Self = if length >= <$t>::BITS {
                        <$t>::MAX
                    } else {
                        (1 << length) - 1
                    };
                    self.get_bits(bits_range) == ones
                }

                #[allow(clippy::cast_possible_truncation)]
                fn get_byte(self, byte_nth: u8) -> u8 {
                    assert!(byte_nth < Self::WIDTH / 8, "byte index {byte_nth} out of range");
                    (self >> (byte_nth * 8)) as u8
                }

                fn set_byte(&mut self, byte_nth: u8, value: u8) {
                    assert!(byte_nth < Self::WIDTH / 8, "byte index {byte_nth} out of range");
                    self.set_bits(byte_nth * 8..=byte_nth * 8 + 7, Self::from(value));
                }
            }
        )*
    };
}

impl_bits!(u8, u16, u32, u64);

/// Sign extends the lowest `bits` bits of `value` to a full `i32`.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Expands an `n`-bit color channel to 8 bits by replicating the high bits.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn expand_channel(value: u32, bits: u32) -> u8 {
    match bits {
        4 => (value * 17) as u8,
        5 => ((value << 3) | (value >> 2)) as u8,
        6 => ((value << 2) | (value >> 4)) as u8,
        _ => value as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[test]
    fn get_bit() {
        let b = 0b1011001110_u32;
        assert!(b.get_bit(1));
        assert!(!b.get_bit(0));
        assert!(b.get_bit(2));
        assert!(!b.get_bit(31));
    }

    #[test]
    fn set_bit() {
        let mut b = 0b1100110_u32;
        b.set_bit(0, true);
        b.set_bit(1, true);
        b.set_bit(2, false);
        b.set_bit(3, false);
        assert_eq!(b, 0b1100011);
    }

    #[test]
    fn get_bits() {
        let b = 0b1011001110_u32;
        assert_eq!(b.get_bits(0..=3), 0b1110);
        assert_eq!(b.get_bits(1..=1), 0b1);
        assert_eq!(b.get_bits(4..=7), 0b1100);
        assert_eq!(b.get_bits(0..=31), 0b10_1100_1110);
        assert_eq!(b.get_bits(28..=31), 0b0);
    }

    #[test]
    fn set_bits() {
        let mut b = 0b10001001_u32;
        b.set_bits(4..=5, 0b11);
        assert_eq!(b, 0b10111001_u32);
        b.set_bits(1..=2, 0b11);
        assert_eq!(b, 0b10111111_u32);
    }

    #[test]
    fn set_bits_then_get_bits_random() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let mut b: u32 = rng.r#gen();
            let v: u32 = rng.gen_range(0..=0x1F);
            b.set_bits(21..=25, v);
            assert_eq!(b.get_bits(21..=25), v);
        }
    }

    #[test]
    fn are_bits_on() {
        let b = 0b1011001110_u32;
        assert!(!b.are_bits_on(0..=3));
        assert!(b.are_bits_on(1..=3));
    }

    #[test]
    fn bytes() {
        let mut b: u32 = 0x0122_0448;
        assert_eq!(b.get_byte(0), 0x48);
        assert_eq!(b.get_byte(3), 0x01);
        b.set_byte(2, 0xAA);
        assert_eq!(b, 0x01AA_0448);
    }

    #[test]
    #[should_panic]
    fn get_byte_panic() {
        0u32.get_byte(4);
    }

    #[test]
    fn check_sign_extended() {
        assert_eq!(sign_extend(0b1001, 4), -7);
        assert_eq!(sign_extend(0xFFFF, 16), -1);
        assert_eq!(sign_extend(0x7FFF, 16), 0x7FFF);
    }

    #[test]
    fn channel_expansion() {
        assert_eq!(expand_channel(0x1F, 5), 0xFF);
        assert_eq!(expand_channel(0x3F, 6), 0xFF);
        assert_eq!(expand_channel(0xF, 4), 0xFF);
        assert_eq!(expand_channel(0, 5), 0);
    }
}
