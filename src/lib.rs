//! Read-optimized maps from fixed-width integer keys to fixed-width values,
//! serialized into compact byte images.
//!
//! The `bucketmap` crate targets the build-once, query-many pattern: a
//! builder ingests an unordered batch of key/value pairs and emits a single
//! contiguous image (a bucket directory addressed by the low key bits,
//! per-bucket sorted key arrays, and a reverse-parsed footer), and a
//! searcher answers point lookups directly against those bytes, whether they
//! live on the heap, in a caller's buffer, or in a memory-mapped file.
//!
//! Two layouts are available: [`BucketMapBuilder`]/[`BucketMap`] store full
//! keys, while [`PackedBucketMapBuilder`]/[`PackedBucketMap`] bit-pack each
//! key down to the high bits the bucket index does not already imply.
//!
//! ```
//! use bucketmap::{BucketMap, BucketMapBuilder, DEFAULT_PAGE_SIZE};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut builder = BucketMapBuilder::default();
//! for i in 0u32..1000 {
//!     builder.add(i, i + 600);
//! }
//! let image = builder.into_image(DEFAULT_PAGE_SIZE)?;
//!
//! let map = BucketMap::<u32, u32>::from_bytes(&image)?;
//! assert_eq!(map.search(17), Some(617));
//! assert_eq!(map.search(4242), None);
//! # Ok(())
//! # }
//! ```

/// Default bucket sizing target: one page of pairs per bucket.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

mod int;
pub use int::FixedInt;

mod bitarray;
pub use bitarray::{BitReader, BitWriter};

mod image;
pub use image::ImageBuf;

mod directory;
pub use directory::{BucketDirectory, BucketEntry, BucketMapInfo, MAX_NKEYS_BITS, MAX_OFFSET_BITS};

mod map;
pub use map::{BucketMap, BucketMapBuilder};

mod packed;
pub use packed::{PackedBucketMap, PackedBucketMapBuilder};
