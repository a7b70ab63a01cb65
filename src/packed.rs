use byteorder::WriteBytesExt;
use std::fs::File;
use std::io::{Read, Result, Write};
use std::marker::PhantomData;

use crate::bitarray::{low_mask, maxbits, BitReader, BitWriter};
use crate::directory::{
    bucket_count_for, packed_block_len, BucketDirectory, BucketEntry, BucketMapInfo, PACKED_FLAG,
};
use crate::image::ImageBuf;
use crate::int::FixedInt;
use crate::map::check_entry_limits;
use crate::DEFAULT_PAGE_SIZE;

/// Builder for the compressed map layout.
///
/// The bucket index already pins the low `log2(B)` bits of every key in a
/// bucket, so only the remaining high bits are stored, bit-packed back to
/// back. On top of that the builder tracks the OR of all inserted keys and
/// trims the stored width down to the highest bit actually observed, which
/// shrinks images further whenever the key universe is sparse at the top.
///
/// Pairs are always staged; partitioning happens when the builder is
/// sealed, which consumes it.
///
/// # Examples
///
/// ```
/// use bucketmap::{PackedBucketMap, PackedBucketMapBuilder};
///
/// # fn main() -> std::io::Result<()> {
/// let mut builder = PackedBucketMapBuilder::default();
/// builder.add(17u32, 1700u32);
/// builder.add(99u32, 9900u32);
///
/// let map = PackedBucketMap::from_builder(builder)?;
/// assert_eq!(map.search(99), Some(9900));
/// assert_eq!(map.search(98), None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PackedBucketMapBuilder<K: FixedInt, V: FixedInt> {
    staging: Vec<(K, V)>,
    kmask: u64,
}

impl<K: FixedInt, V: FixedInt> Default for PackedBucketMapBuilder<K, V> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<K: FixedInt, V: FixedInt> PackedBucketMapBuilder<K, V> {
    /// Creates a builder with a staging capacity hint.
    pub fn new(reserve: usize) -> Self {
        PackedBucketMapBuilder {
            staging: Vec::with_capacity(reserve),
            kmask: 0,
        }
    }

    /// Records a pair. Duplicate keys are accepted and kept.
    pub fn add(&mut self, key: K, value: V) {
        self.kmask |= key.to_u64();
        self.staging.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Seals the builder and streams the image to `writer`.
    ///
    /// An empty builder writes the single zero footer byte; otherwise the
    /// footer is two bytes, the stored key width then the bucket exponent
    /// with its high bit set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when a bucket exceeds 2^21 - 1 keys or the
    /// image exceeds 2^43 bytes, and forwards IO errors from the sink.
    pub fn serialize<W: Write>(self, mut writer: W, page_size: usize) -> Result<BucketMapInfo> {
        let nrec = self.staging.len();
        let nbuckets = bucket_count_for((K::BYTES + V::BYTES) * nrec, page_size);
        if nbuckets == 0 {
            writer.write_u8(0)?;
            return Ok(BucketMapInfo {
                image_len: 1,
                ..BucketMapInfo::default()
            });
        }

        let mask = (nbuckets - 1) as u64;
        let mut buckets: Vec<Vec<(K, V)>> = vec![Vec::new(); nbuckets];
        for (key, value) in self.staging {
            buckets[(key.to_u64() & mask) as usize].push((key, value));
        }

        let n = nbuckets.trailing_zeros();
        // the directory pins the low n bits; store the rest, trimmed to the
        // highest bit observed across all keys
        let key_bits_kept = K::BITS - n;
        let key_rshift_by = K::BITS - key_bits_kept;
        let key_bits_store = maxbits(self.kmask >> key_rshift_by);

        let mut offset = (nbuckets * 8) as u64;
        let mut entry_count = 0u64;
        let mut empty_buckets = 0usize;
        for bucket in &buckets {
            let nkeys = bucket.len();
            check_entry_limits(offset, nkeys)?;
            BucketEntry {
                offset,
                nkeys: nkeys as u32,
            }
            .write_to(&mut writer)?;
            if nkeys > 0 {
                offset +=
                    (nkeys * V::BYTES + packed_block_len(nkeys as u32, key_bits_store)) as u64;
                entry_count += nkeys as u64;
            } else {
                empty_buckets += 1;
            }
        }

        for bucket in &mut buckets {
            if bucket.is_empty() {
                continue;
            }
            bucket.sort_unstable();

            let mut packed = BitWriter::with_capacity(bucket.len() as u64 * key_bits_store as u64);
            for &(key, _) in bucket.iter() {
                packed.push_bits(key.to_u64() >> key_rshift_by, key_bits_store);
            }
            writer.write_all(packed.as_bytes())?;

            for &(_, value) in bucket.iter() {
                value.write_le(&mut writer)?;
            }
        }

        writer.write_u8(key_bits_store as u8)?;
        writer.write_u8(n as u8 | PACKED_FLAG)?;
        Ok(BucketMapInfo {
            image_len: offset + 2,
            entry_count,
            bucket_count: nbuckets,
            empty_buckets,
            key_bits_store,
        })
    }

    /// Seals the builder into an in-memory image.
    pub fn into_image(self, page_size: usize) -> Result<Vec<u8>> {
        let nrec = self.staging.len();
        let nbuckets = bucket_count_for((K::BYTES + V::BYTES) * nrec, page_size);
        let mut buffer = Vec::with_capacity(nbuckets * 8 + nrec * (K::BYTES + V::BYTES) + 2);
        self.serialize(&mut buffer, page_size)?;
        Ok(buffer)
    }
}

/// Read-only searcher over a compressed image.
///
/// Lookups reduce the probe key by the bucket exponent and binary-search
/// the bucket's bit-packed key block through a [`BitReader`] bound to it,
/// then read the value from the raw array that follows the block.
#[derive(Debug)]
pub struct PackedBucketMap<'a, K: FixedInt, V: FixedInt> {
    directory: BucketDirectory<'a>,
    mask: u64,
    key_rshift_by: u32,
    key_mask: u64,
    phantom: PhantomData<(K, V)>,
}

impl<'a, K: FixedInt, V: FixedInt> PackedBucketMap<'a, K, V> {
    /// Wraps an image, taking ownership of its bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when the footer or directory is malformed.
    pub fn from_image(image: ImageBuf<'a>) -> Result<Self> {
        let directory = BucketDirectory::new(image)?;
        let mask = directory.mask();
        let n = if directory.nbuckets() > 0 {
            directory.nbuckets().trailing_zeros()
        } else {
            0
        };
        let key_bits_kept = K::BITS - n;
        Ok(PackedBucketMap {
            mask,
            key_rshift_by: K::BITS - key_bits_kept,
            key_mask: low_mask(directory.key_bits_store()),
            directory,
            phantom: PhantomData,
        })
    }

    /// Borrows an image from caller-owned bytes, zero-copy.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        Self::from_image(bytes.into())
    }

    /// Reads a stream to its end and wraps the owned image.
    pub fn from_reader<R: Read>(reader: R) -> Result<PackedBucketMap<'static, K, V>> {
        PackedBucketMap::from_image(ImageBuf::from_reader(reader)?)
    }

    /// Memory-maps a file and wraps it, zero-copy.
    pub fn from_file(file: &File) -> Result<PackedBucketMap<'static, K, V>> {
        PackedBucketMap::from_image(ImageBuf::map_file(file)?)
    }

    /// Seals a builder and wraps the resulting image directly, with no
    /// intermediate stream.
    pub fn from_builder(
        builder: PackedBucketMapBuilder<K, V>,
    ) -> Result<PackedBucketMap<'static, K, V>> {
        PackedBucketMap::from_image(builder.into_image(DEFAULT_PAGE_SIZE)?.into())
    }

    /// Point lookup. Absent keys return `None`; with duplicate keys one of
    /// the stored values is returned.
    pub fn search(&self, key: K) -> Option<V> {
        if self.directory.nbuckets() == 0 {
            return None;
        }
        let (bucket, nkeys) = self.directory.unpacked((key.to_u64() & self.mask) as usize);
        if nkeys == 0 {
            return None;
        }

        let reduced = key.to_u64() >> self.key_rshift_by;
        let keys = BitReader::new(bucket);
        let width = self.directory.key_bits_store() as u64;

        let (mut l, mut u) = (0u32, nkeys);
        while l < u {
            let m = (l + u) >> 1;
            let probe = keys.get_bits(m as u64 * width, self.key_mask);
            if probe > reduced {
                u = m;
            } else if probe < reduced {
                l = m + 1;
            } else {
                let values_start = self.directory.compressed_keys_size(nkeys);
                return Some(V::read_le(&bucket[values_start + m as usize * V::BYTES..]));
            }
        }
        None
    }

    /// Number of records; computed by summing the directory.
    pub fn len(&self) -> u64 {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bits stored per key, from the footer.
    pub fn key_bits_store(&self) -> u32 {
        self.directory.key_bits_store()
    }

    /// Directory slot `i`. The caller must keep `i` below the bucket count
    /// reported by [`info`](Self::info).
    pub fn bucket(&self, i: usize) -> BucketEntry {
        self.directory.get(i)
    }

    /// Image size in bytes.
    pub fn image_len(&self) -> usize {
        self.directory.image_len()
    }

    pub fn info(&self) -> BucketMapInfo {
        BucketMapInfo {
            image_len: self.directory.image_len() as u64,
            entry_count: self.directory.len(),
            bucket_count: self.directory.nbuckets(),
            empty_buckets: self.directory.empty_buckets(),
            key_bits_store: self.directory.key_bits_store(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{BucketMap, BucketMapBuilder};
    use std::io::Seek;

    #[test]
    fn test_basic() {
        let mut builder = PackedBucketMapBuilder::default();
        builder.add(1u32, 10u32);
        builder.add(2, 20);
        builder.add(3, 30);

        let map = PackedBucketMap::from_builder(builder).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.search(1), Some(10));
        assert_eq!(map.search(2), Some(20));
        assert_eq!(map.search(3), Some(30));
        assert_eq!(map.search(4), None);
    }

    #[test]
    fn test_even_keys_match_plain_variant() {
        let (from, to) = (335u32, 100_500u32);
        let mut packed = PackedBucketMapBuilder::default();
        let mut plain = BucketMapBuilder::default();
        for i in (from..to).filter(|i| i & 1 == 0) {
            packed.add(i, i + 37);
            plain.add(i, i + 37);
        }
        assert_eq!(packed.len(), ((to - from) / 2) as usize);

        let packed = PackedBucketMap::from_builder(packed).unwrap();
        let plain = BucketMap::from_builder(plain).unwrap();
        for i in from..to {
            assert_eq!(packed.search(i), plain.search(i), "key {}", i);
            if i & 1 == 0 {
                assert_eq!(packed.search(i), Some(i + 37));
            } else {
                assert_eq!(packed.search(i), None);
            }
            assert_eq!(packed.search(i + to), None);
        }
    }

    fn check_range<K: FixedInt, V: FixedInt>(
        from: u64,
        to: u64,
        make_key: fn(u64) -> K,
        make_value: fn(u64) -> V,
    ) {
        assert!(from <= to);
        let mut packed = PackedBucketMapBuilder::new((to - from) as usize);
        let mut plain = BucketMapBuilder::new((to - from) as usize, DEFAULT_PAGE_SIZE);
        for i in from..to {
            packed.add(make_key(i), make_value(i + 117));
            plain.add(make_key(i), make_value(i + 117));
        }

        let packed = PackedBucketMap::from_builder(packed).unwrap();
        let plain = BucketMap::from_builder(plain).unwrap();
        for i in from..to {
            let found = packed.search(make_key(i));
            assert_eq!(found, plain.search(make_key(i)));
            assert_eq!(found, Some(make_value(i + 117)));
        }
        for i in to..to + 1000 {
            assert_eq!(packed.search(make_key(i)), plain.search(make_key(i)));
        }
    }

    #[test]
    fn test_variants_agree_across_widths() {
        check_range::<u32, u64>(0, 10_001, |i| i as u32, |i| i);
        check_range::<u64, u64>(10_001, 100_003, |i| i, |i| i);
        check_range::<u64, u32>(111, 88_774, |i| i, |i| i as u32);
    }

    #[test]
    fn test_empty() {
        let builder = PackedBucketMapBuilder::<u32, u32>::default();
        let image = builder.into_image(DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(image, vec![0]);

        let map = PackedBucketMap::<u32, u32>::from_image(image.into()).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.key_bits_store(), 0);
        assert_eq!(map.search(0), None);
        assert_eq!(map.search(54321), None);
    }

    #[test]
    fn test_single_element() {
        let mut builder = PackedBucketMapBuilder::default();
        builder.add(7u32, 700u32);
        let image = builder.into_image(DEFAULT_PAGE_SIZE).unwrap();
        // one slot, one packed word, one value, two footer bytes
        assert_eq!(image.len(), 8 + 8 + 4 + 2);

        let map = PackedBucketMap::<u32, u32>::from_image(image.into()).unwrap();
        assert_eq!(map.info().bucket_count, 1);
        assert_eq!(map.bucket(0), BucketEntry { offset: 8, nkeys: 1 });
        assert_eq!(map.key_bits_store(), 3);
        assert_eq!(map.search(7), Some(700));
        assert_eq!(map.search(6), None);
        assert_eq!(map.search(8), None);
    }

    #[test]
    fn test_key_bits_edges() {
        // single-bucket maps keep the exponent at zero, so the stored width
        // tracks the highest observed key bit exactly
        let cases: [(&[u64], u32); 4] = [
            (&[0, 1], 1),
            (&[3, 0x40, 0x7f], 7),
            (&[1, 0x8000_0000], 32),
            (&[5, 1 << 63], 64),
        ];
        for (keys, expected_bits) in cases {
            let mut builder = PackedBucketMapBuilder::default();
            for &k in keys {
                builder.add(k, k.wrapping_add(9));
            }
            let map = PackedBucketMap::from_builder(builder).unwrap();
            assert_eq!(map.key_bits_store(), expected_bits);
            for &k in keys {
                assert_eq!(map.search(k), Some(k.wrapping_add(9)), "width {}", expected_bits);
            }
            assert_eq!(map.search(2), None);
        }
    }

    #[test]
    fn test_in_bucket_miss() {
        let mut builder = PackedBucketMapBuilder::default();
        for k in [10u32, 20, 30] {
            builder.add(k, k * 10);
        }
        let map = PackedBucketMap::from_builder(builder).unwrap();
        assert_eq!(map.search(10), Some(100));
        assert_eq!(map.search(30), Some(300));
        // keys strictly inside the bucket's stored range must still miss
        assert_eq!(map.search(15), None);
        assert_eq!(map.search(25), None);
        assert_eq!(map.search(5), None);
        assert_eq!(map.search(35), None);
    }

    #[test]
    fn test_duplicate_keys() {
        let mut builder = PackedBucketMapBuilder::default();
        builder.add(42u32, 1u32);
        builder.add(42, 2);
        builder.add(90, 5);
        let map = PackedBucketMap::from_builder(builder).unwrap();
        let found = map.search(42).unwrap();
        assert!(found == 1 || found == 2);
        assert_eq!(map.search(41), None);
        assert_eq!(map.search(43), None);
    }

    #[test]
    fn test_kmask_trims_stored_width() {
        let mut builder = PackedBucketMapBuilder::default();
        for i in 0..10_000u32 {
            builder.add(i, i + 1);
        }
        let map = PackedBucketMap::from_builder(builder).unwrap();
        let info = map.info();
        assert!(info.bucket_count > 1);
        // every key fits in 14 bits, so far fewer than 32 - n are stored
        let n = info.bucket_count.trailing_zeros();
        assert_eq!(info.key_bits_store, 14 - n);
        for i in (0..10_000u32).step_by(13) {
            assert_eq!(map.search(i), Some(i + 1));
        }
    }

    #[test]
    fn test_scrambled_keys() {
        use foldhash::fast::FixedState;
        use std::hash::BuildHasher;

        let state = FixedState::with_seed(7);
        let mut packed = PackedBucketMapBuilder::new(50_000);
        let mut plain = BucketMapBuilder::default();
        for i in 0..50_000u64 {
            let key = state.hash_one(i);
            packed.add(key, i);
            plain.add(key, i);
        }

        let packed = PackedBucketMap::from_builder(packed).unwrap();
        let plain = BucketMap::from_builder(plain).unwrap();
        for i in 0..50_000u64 {
            let key = state.hash_one(i);
            assert_eq!(packed.search(key), plain.search(key));
            assert!(packed.search(key).is_some());
        }
        for i in 0..1000u64 {
            let key = state.hash_one(i ^ u64::MAX);
            assert_eq!(packed.search(key), plain.search(key));
        }
    }

    #[test]
    fn test_file_round_trip() {
        let (from, to) = (1200u32, 50_000u32);
        let mut builder = PackedBucketMapBuilder::default();
        for i in from..to {
            builder.add(i, i + 600);
        }

        let mut file = tempfile::tempfile().unwrap();
        let info = builder.serialize(&mut file, DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(info.image_len, file.metadata().unwrap().len());
        assert_eq!(info.entry_count, (to - from) as u64);

        file.rewind().unwrap();
        let map = PackedBucketMap::<u32, u32>::from_reader(&file).unwrap();
        assert_eq!(map.key_bits_store(), info.key_bits_store);
        for i in from..to {
            assert_eq!(map.search(i), Some(i + 600));
        }
        for i in to..to + 5000 {
            assert_eq!(map.search(i), None);
        }
    }

    #[test]
    fn test_mmap_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packed.bin");
        let mut builder = PackedBucketMapBuilder::default();
        for i in 0..10_000u64 {
            builder.add(i * 2, i);
        }
        builder
            .serialize(File::create(&path).unwrap(), DEFAULT_PAGE_SIZE)
            .unwrap();

        let map = PackedBucketMap::<u64, u64>::from_file(&File::open(&path).unwrap()).unwrap();
        for i in (0..10_000u64).step_by(101) {
            assert_eq!(map.search(i * 2), Some(i));
            assert_eq!(map.search(i * 2 + 1), None);
        }
    }
}
