use byteorder::WriteBytesExt;
use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::marker::PhantomData;

use crate::directory::{
    bucket_count_for, BucketDirectory, BucketEntry, BucketMapInfo, MAX_NKEYS_BITS, MAX_OFFSET_BITS,
};
use crate::image::ImageBuf;
use crate::int::FixedInt;
use crate::DEFAULT_PAGE_SIZE;

/// Builder for the uncompressed map layout: full keys and values stored as
/// parallel arrays inside each bucket.
///
/// Pass the total record count up front when it is known; the bucket
/// directory is then sized immediately and every [`add`](Self::add) goes
/// straight into its destination bucket. With an unknown count pairs are
/// staged in one list and partitioned when the builder is sealed.
///
/// Sealing consumes the builder: [`serialize`](Self::serialize) streams the
/// image to a sink, [`into_image`](Self::into_image) materializes it in
/// memory.
///
/// # Examples
///
/// ```
/// use bucketmap::{BucketMap, BucketMapBuilder};
///
/// # fn main() -> std::io::Result<()> {
/// let mut builder = BucketMapBuilder::default();
/// builder.add(17u32, 1700u32);
/// builder.add(99u32, 9900u32);
///
/// let map = BucketMap::from_builder(builder)?;
/// assert_eq!(map.search(17), Some(1700));
/// assert_eq!(map.search(18), None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BucketMapBuilder<K: FixedInt, V: FixedInt> {
    staging: Vec<(K, V)>,
    buckets: Vec<Vec<(K, V)>>,
    hash_mask: u64,
}

impl<K: FixedInt, V: FixedInt> Default for BucketMapBuilder<K, V> {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

impl<K: FixedInt, V: FixedInt> BucketMapBuilder<K, V> {
    /// Creates a builder; `known_len` of zero selects staging mode.
    pub fn new(known_len: usize, page_size: usize) -> Self {
        let nbuckets = bucket_count_for((K::BYTES + V::BYTES) * known_len, page_size);
        BucketMapBuilder {
            staging: Vec::new(),
            buckets: vec![Vec::new(); nbuckets],
            hash_mask: nbuckets.saturating_sub(1) as u64,
        }
    }

    /// Records a pair. Duplicate keys are accepted and kept.
    pub fn add(&mut self, key: K, value: V) {
        if self.buckets.is_empty() {
            self.staging.push((key, value));
        } else {
            let index = (key.to_u64() & self.hash_mask) as usize;
            self.buckets[index].push((key, value));
        }
    }

    /// Number of pairs recorded so far; summed over the buckets in
    /// pre-sized mode.
    pub fn len(&self) -> usize {
        if self.buckets.is_empty() {
            self.staging.len()
        } else {
            self.buckets.iter().map(Vec::len).sum()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seals the builder and streams the image to `writer`.
    ///
    /// `page_size` only matters in staging mode, where it drives the bucket
    /// count; a pre-sized builder keeps the directory chosen at
    /// construction. An empty builder writes the single zero footer byte.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when a bucket exceeds 2^21 - 1 keys or the
    /// image exceeds 2^43 bytes, and forwards IO errors from the sink.
    pub fn serialize<W: Write>(self, mut writer: W, page_size: usize) -> Result<BucketMapInfo> {
        let mut buckets = if !self.buckets.is_empty() {
            self.buckets
        } else {
            partition(self.staging, page_size)
        };

        if buckets.is_empty() {
            writer.write_u8(0)?;
            return Ok(BucketMapInfo {
                image_len: 1,
                ..BucketMapInfo::default()
            });
        }

        let pair_bytes = K::BYTES + V::BYTES;
        let mut offset = (buckets.len() * 8) as u64;
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
            offset += (nkeys * pair_bytes) as u64;
            entry_count += nkeys as u64;
            if nkeys == 0 {
                empty_buckets += 1;
            }
        }

        for bucket in &mut buckets {
            bucket.sort_unstable();
            for &(key, _) in bucket.iter() {
                key.write_le(&mut writer)?;
            }
            for &(_, value) in bucket.iter() {
                value.write_le(&mut writer)?;
            }
        }

        writer.write_u8(buckets.len().trailing_zeros() as u8)?;
        Ok(BucketMapInfo {
            image_len: offset + 1,
            entry_count,
            bucket_count: buckets.len(),
            empty_buckets,
            key_bits_store: 0,
        })
    }

    /// Seals the builder into an in-memory image, pre-reserving the exact
    /// final size.
    pub fn into_image(self, page_size: usize) -> Result<Vec<u8>> {
        let nbuckets = if !self.buckets.is_empty() {
            self.buckets.len()
        } else {
            bucket_count_for((K::BYTES + V::BYTES) * self.staging.len(), page_size)
        };
        let mut buffer = Vec::with_capacity(nbuckets * 8 + self.len() * (K::BYTES + V::BYTES) + 1);
        self.serialize(&mut buffer, page_size)?;
        Ok(buffer)
    }
}

fn partition<K: FixedInt, V: FixedInt>(staging: Vec<(K, V)>, page_size: usize) -> Vec<Vec<(K, V)>> {
    let nbuckets = bucket_count_for((K::BYTES + V::BYTES) * staging.len(), page_size);
    let mut buckets: Vec<Vec<(K, V)>> = vec![Vec::new(); nbuckets];
    let mask = nbuckets.saturating_sub(1) as u64;
    for (key, value) in staging {
        buckets[(key.to_u64() & mask) as usize].push((key, value));
    }
    buckets
}

pub(crate) fn check_entry_limits(offset: u64, nkeys: usize) -> Result<()> {
    if nkeys >= 1 << MAX_NKEYS_BITS {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("bucket of {} keys exceeds the 2^21 - 1 limit", nkeys),
        ));
    }
    if offset >= 1 << MAX_OFFSET_BITS {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("image offset {} exceeds the 2^43 limit", offset),
        ));
    }
    Ok(())
}

/// Read-only searcher over an uncompressed image.
///
/// Lookups resolve the bucket from the low key bits, binary-search the
/// bucket's sorted key array in place, and read the value out of the
/// parallel array. The image is never copied or mutated; `search` takes
/// `&self` and the values come back by value.
#[derive(Debug)]
pub struct BucketMap<'a, K: FixedInt, V: FixedInt> {
    directory: BucketDirectory<'a>,
    mask: u64,
    phantom: PhantomData<(K, V)>,
}

impl<'a, K: FixedInt, V: FixedInt> BucketMap<'a, K, V> {
    /// Wraps an image, taking ownership of its bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` when the footer or directory is malformed.
    pub fn from_image(image: ImageBuf<'a>) -> Result<Self> {
        let directory = BucketDirectory::new(image)?;
        let mask = directory.mask();
        Ok(BucketMap {
            directory,
            mask,
            phantom: PhantomData,
        })
    }

    /// Borrows an image from caller-owned bytes, zero-copy.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        Self::from_image(bytes.into())
    }

    /// Reads a stream to its end and wraps the owned image.
    pub fn from_reader<R: Read>(reader: R) -> Result<BucketMap<'static, K, V>> {
        BucketMap::from_image(ImageBuf::from_reader(reader)?)
    }

    /// Memory-maps a file and wraps it, zero-copy.
    pub fn from_file(file: &File) -> Result<BucketMap<'static, K, V>> {
        BucketMap::from_image(ImageBuf::map_file(file)?)
    }

    /// Seals a builder and wraps the resulting image directly, with no
    /// intermediate stream.
    pub fn from_builder(builder: BucketMapBuilder<K, V>) -> Result<BucketMap<'static, K, V>> {
        BucketMap::from_image(builder.into_image(DEFAULT_PAGE_SIZE)?.into())
    }

    /// Point lookup. Absent keys return `None`; with duplicate keys one of
    /// the stored values is returned.
    pub fn search(&self, key: K) -> Option<V> {
        if self.directory.nbuckets() == 0 {
            return None;
        }
        let entry = self.directory.get((key.to_u64() & self.mask) as usize);
        let nkeys = entry.nkeys as usize;
        if nkeys == 0 {
            return None;
        }

        let data = self.directory.data();
        let keys_start = entry.offset as usize;
        let values_start = keys_start + nkeys * K::BYTES;

        let (mut l, mut u) = (0usize, nkeys);
        while l < u {
            let m = (l + u) >> 1;
            let probe = K::read_le(&data[keys_start + m * K::BYTES..]);
            if probe > key {
                u = m;
            } else if probe < key {
                l = m + 1;
            } else {
                return Some(V::read_le(&data[values_start + m * V::BYTES..]));
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
