use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;
use std::io::{Error, ErrorKind, Result, Write};

use crate::image::ImageBuf;

/// Offsets address up to 2^43 bytes of image.
pub const MAX_OFFSET_BITS: u32 = 43;
/// Bucket population is capped at 2^21 - 1 keys.
pub const MAX_NKEYS_BITS: u32 = 21;

/// Footer bit signalling a two-byte footer with a stored key width.
pub(crate) const PACKED_FLAG: u8 = 0x80;

/// Directory slot describing one bucket: where its payload starts and how
/// many pairs it holds.
///
/// Packs into exactly 8 bytes on the wire: bits [0..43) hold `offset`,
/// bits [43..64) hold `nkeys`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketEntry {
    /// Absolute byte offset of the bucket payload from the image start.
    pub offset: u64,
    /// Number of key/value pairs stored in the bucket.
    pub nkeys: u32,
}

impl BucketEntry {
    const OFFSET_MASK: u64 = (1 << MAX_OFFSET_BITS) - 1;

    pub fn pack(self) -> u64 {
        debug_assert!(self.offset <= Self::OFFSET_MASK);
        debug_assert!(self.nkeys < 1 << MAX_NKEYS_BITS);
        (self.offset & Self::OFFSET_MASK) | ((self.nkeys as u64) << MAX_OFFSET_BITS)
    }

    pub fn unpack(raw: u64) -> Self {
        BucketEntry {
            offset: raw & Self::OFFSET_MASK,
            nkeys: (raw >> MAX_OFFSET_BITS) as u32,
        }
    }

    pub(crate) fn write_to<W: Write>(self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.pack())
    }
}

/// Number of buckets for a payload of `kv_total_bytes`, targeting roughly
/// one page of pairs per bucket. Always a power of two; zero for empty
/// input.
pub(crate) fn bucket_count_for(kv_total_bytes: usize, page_size: usize) -> usize {
    if kv_total_bytes == 0 {
        return 0;
    }
    let ratio = (kv_total_bytes / page_size.max(1)).max(1);
    ratio.next_power_of_two()
}

/// Byte length of a packed-key block holding `nrec` keys of `key_bits` bits:
/// always a whole number of 64-bit words.
pub(crate) fn packed_block_len(nrec: u32, key_bits: u32) -> usize {
    ((nrec as u64 * key_bits as u64).div_ceil(64) * 8) as usize
}

/// Summary of a serialized image, returned by the builders and reported by
/// the searchers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BucketMapInfo {
    /// Total image size in bytes.
    pub image_len: u64,
    /// Number of key/value pairs serialized.
    pub entry_count: u64,
    /// Number of directory buckets.
    pub bucket_count: usize,
    /// Number of buckets that ended up empty.
    pub empty_buckets: usize,
    /// Bits stored per key; zero for the uncompressed layout.
    pub key_bits_store: u32,
}

/// Bucket directory over a serialized image.
///
/// Construction parses the footer in reverse (last byte first) and validates
/// that the directory fits inside the image; the image is then owned for the
/// directory's lifetime and never mutated.
#[derive(Debug)]
pub struct BucketDirectory<'a> {
    image: ImageBuf<'a>,
    nbuckets: usize,
    key_bits_store: u32,
}

impl<'a> BucketDirectory<'a> {
    /// Takes ownership of `image` and parses its footer.
    ///
    /// A single zero byte is the canonical empty image. Anything else must
    /// carry a directory of `1 << N` entries before the footer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when the image is empty, the footer is
    /// truncated or out of range, or the image is shorter than the directory
    /// it declares.
    pub fn new(image: ImageBuf<'a>) -> Result<Self> {
        let data = image.as_slice();
        let Some(&footer) = data.last() else {
            return Err(Error::new(ErrorKind::InvalidData, "empty image"));
        };

        let (key_bits_store, footer_len) = if footer & PACKED_FLAG != 0 {
            if data.len() < 2 {
                return Err(Error::new(ErrorKind::InvalidData, "truncated image footer"));
            }
            (data[data.len() - 2] as u32, 2)
        } else {
            (0, 1)
        };

        let n = (footer & !PACKED_FLAG) as u32;
        let nbuckets = if data.len() == 1 && footer == 0 {
            0
        } else {
            if n > MAX_OFFSET_BITS || key_bits_store > 64 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("implausible image footer: n={} key_bits={}", n, key_bits_store),
                ));
            }
            let nbuckets = 1usize << n;
            if data.len() < nbuckets * 8 + footer_len {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "image of {} bytes cannot hold a directory of {} buckets",
                        data.len(),
                        nbuckets
                    ),
                ));
            }
            nbuckets
        };

        Ok(BucketDirectory {
            image,
            nbuckets,
            key_bits_store,
        })
    }

    pub fn mask(&self) -> u64 {
        self.nbuckets.saturating_sub(1) as u64
    }

    pub fn nbuckets(&self) -> usize {
        self.nbuckets
    }

    /// Bits stored per key, from the footer; zero for uncompressed images.
    pub fn key_bits_store(&self) -> u32 {
        self.key_bits_store
    }

    pub fn data(&self) -> &[u8] {
        self.image.as_slice()
    }

    pub fn image_len(&self) -> usize {
        self.image.len()
    }

    /// Directory slot `i`.
    pub fn get(&self, i: usize) -> BucketEntry {
        debug_assert!(i < self.nbuckets);
        let raw = LittleEndian::read_u64(&self.data()[i * 8..]);
        BucketEntry::unpack(raw)
    }

    /// Bucket payload for slot `i`: the image suffix starting at the
    /// bucket's offset, plus its pair count.
    pub fn unpacked(&self, i: usize) -> (&[u8], u32) {
        let entry = self.get(i);
        (&self.data()[entry.offset as usize..], entry.nkeys)
    }

    /// Total number of records, summed over the directory on each call.
    pub fn len(&self) -> u64 {
        (0..self.nbuckets).map(|i| self.get(i).nkeys as u64).sum()
    }

    pub(crate) fn empty_buckets(&self) -> usize {
        (0..self.nbuckets).filter(|&i| self.get(i).nkeys == 0).count()
    }

    /// Byte length of slot `i`'s packed-key block for `nrec` records, using
    /// the stored per-key width.
    pub fn compressed_keys_size(&self, nrec: u32) -> usize {
        packed_block_len(nrec, self.key_bits_store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_pack() {
        for entry in [
            BucketEntry { offset: 0, nkeys: 0 },
            BucketEntry { offset: 8, nkeys: 1 },
            BucketEntry {
                offset: (1 << MAX_OFFSET_BITS) - 1,
                nkeys: (1 << MAX_NKEYS_BITS) - 1,
            },
        ] {
            assert_eq!(BucketEntry::unpack(entry.pack()), entry);
        }

        let mut buf = Vec::new();
        BucketEntry { offset: 24, nkeys: 3 }.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(BucketEntry::unpack(LittleEndian::read_u64(&buf)), BucketEntry {
            offset: 24,
            nkeys: 3
        });
    }

    #[test]
    fn test_bucket_count_for() {
        assert_eq!(bucket_count_for(0, 4096), 0);
        assert_eq!(bucket_count_for(8, 4096), 1);
        assert_eq!(bucket_count_for(4096, 4096), 1);
        assert_eq!(bucket_count_for(8192, 4096), 2);
        assert_eq!(bucket_count_for(3 * 4096, 4096), 4);
        assert_eq!(bucket_count_for(1 << 20, 4096), 256);
    }

    #[test]
    fn test_packed_block_len() {
        assert_eq!(packed_block_len(0, 13), 0);
        assert_eq!(packed_block_len(5, 0), 0);
        assert_eq!(packed_block_len(1, 1), 8);
        assert_eq!(packed_block_len(64, 1), 8);
        assert_eq!(packed_block_len(65, 1), 16);
        assert_eq!(packed_block_len(3, 64), 24);
    }

    #[test]
    fn test_footer_parsing() {
        // canonical empty image
        let dir = BucketDirectory::new(vec![0u8].into()).unwrap();
        assert_eq!(dir.nbuckets(), 0);
        assert_eq!(dir.key_bits_store(), 0);
        assert_eq!(dir.len(), 0);

        // one empty bucket, plain footer
        let mut image = Vec::new();
        BucketEntry { offset: 8, nkeys: 0 }.write_to(&mut image).unwrap();
        image.push(0);
        let dir = BucketDirectory::new(image.into()).unwrap();
        assert_eq!(dir.nbuckets(), 1);
        assert_eq!(dir.key_bits_store(), 0);

        // one empty bucket, packed footer carrying a key width
        let mut image = Vec::new();
        BucketEntry { offset: 8, nkeys: 0 }.write_to(&mut image).unwrap();
        image.push(5);
        image.push(PACKED_FLAG);
        let dir = BucketDirectory::new(image.into()).unwrap();
        assert_eq!(dir.nbuckets(), 1);
        assert_eq!(dir.key_bits_store(), 5);
        assert_eq!(dir.compressed_keys_size(13), 16);
    }

    #[test]
    fn test_rejects_malformed() {
        BucketDirectory::new(Vec::new().into()).unwrap_err();
        // packed flag with no preceding byte
        BucketDirectory::new(vec![PACKED_FLAG].into()).unwrap_err();
        // declares a directory the image cannot hold
        BucketDirectory::new(vec![3u8].into()).unwrap_err();
        // out-of-range bucket exponent
        BucketDirectory::new(vec![0u8; 100].into_iter().chain([0x7f]).collect::<Vec<_>>().into())
            .unwrap_err();
    }

    #[test]
    fn test_len_sums_directory() {
        let mut image = Vec::new();
        BucketEntry { offset: 16, nkeys: 3 }.write_to(&mut image).unwrap();
        BucketEntry { offset: 40, nkeys: 9 }.write_to(&mut image).unwrap();
        image.resize(16 + (3 + 9) * 8, 0);
        image.push(1);
        let dir = BucketDirectory::new(image.into()).unwrap();
        assert_eq!(dir.nbuckets(), 2);
        assert_eq!(dir.len(), 12);
        assert_eq!(dir.empty_buckets(), 0);
        assert_eq!(dir.get(1), BucketEntry { offset: 40, nkeys: 9 });
    }
}
