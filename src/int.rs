use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{Result, Write};

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Fixed-width unsigned integer usable as a map key or value.
///
/// The trait is sealed and implemented exactly for `u32` and `u64`; other
/// widths are rejected at compile time. All bit arithmetic on keys (bucket
/// masking, reduction shifts, `kmask` accumulation) happens in the `u64`
/// domain via [`to_u64`](Self::to_u64).
pub trait FixedInt: sealed::Sealed + Copy + Ord + std::fmt::Debug + 'static {
    /// Serialized width in bytes (4 or 8).
    const BYTES: usize;
    /// Width in bits (32 or 64).
    const BITS: u32;

    fn to_u64(self) -> u64;

    /// Decodes a value from the first [`BYTES`](Self::BYTES) bytes of `buf`.
    fn read_le(buf: &[u8]) -> Self;

    /// Appends the little-endian encoding of `self` to `w`.
    fn write_le<W: Write>(self, w: &mut W) -> Result<()>;
}

impl FixedInt for u32 {
    const BYTES: usize = 4;
    const BITS: u32 = 32;

    #[inline]
    fn to_u64(self) -> u64 {
        self as u64
    }

    #[inline]
    fn read_le(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }

    #[inline]
    fn write_le<W: Write>(self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self)
    }
}

impl FixedInt for u64 {
    const BYTES: usize = 8;
    const BITS: u32 = 64;

    #[inline]
    fn to_u64(self) -> u64 {
        self
    }

    #[inline]
    fn read_le(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }

    #[inline]
    fn write_le<W: Write>(self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        0xdead_beefu32.write_le(&mut buf).unwrap();
        0x0123_4567_89ab_cdefu64.write_le(&mut buf).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(u32::read_le(&buf), 0xdead_beef);
        assert_eq!(u64::read_le(&buf[4..]), 0x0123_4567_89ab_cdef);
    }
}
