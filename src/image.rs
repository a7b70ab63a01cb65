use memmap2::Mmap;
use std::fs::File;
use std::io::{Read, Result};

/// Byte region holding a serialized map image, tagged with its disposal
/// policy.
///
/// Exactly one party owns the image at any time; searchers take an
/// `ImageBuf` by value and never mutate it. `Borrowed` allows several
/// searchers to share one region zero-copy, `Mapped` serves images straight
/// from the page cache.
#[derive(Debug)]
pub enum ImageBuf<'a> {
    /// Heap-allocated image, freed on drop.
    Owned(Vec<u8>),
    /// View into caller-owned bytes.
    Borrowed(&'a [u8]),
    /// Memory-mapped file, unmapped on drop.
    Mapped(Mmap),
}

impl<'a> ImageBuf<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ImageBuf::Owned(v) => v,
            ImageBuf::Borrowed(s) => s,
            ImageBuf::Mapped(m) => m,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Reads a stream to its end into an owned image.
    ///
    /// # Errors
    ///
    /// Forwards any IO error from the underlying reader.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<ImageBuf<'static>> {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        Ok(ImageBuf::Owned(buffer))
    }

    /// Memory-maps a file as a read-only image.
    ///
    /// # Errors
    ///
    /// Forwards the mapping failure from the OS.
    pub fn map_file(file: &File) -> Result<ImageBuf<'static>> {
        // Read-only map; the file must not be truncated while the searcher
        // holds it.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(ImageBuf::Mapped(mmap))
    }
}

impl From<Vec<u8>> for ImageBuf<'static> {
    fn from(buffer: Vec<u8>) -> Self {
        ImageBuf::Owned(buffer)
    }
}

impl<'a> From<&'a [u8]> for ImageBuf<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageBuf::Borrowed(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_variants() {
        let bytes = vec![1u8, 2, 3];
        let owned: ImageBuf = bytes.clone().into();
        let borrowed: ImageBuf = bytes.as_slice().into();
        assert_eq!(owned.as_slice(), borrowed.as_slice());
        assert_eq!(owned.len(), 3);
        assert!(!owned.is_empty());
    }

    #[test]
    fn test_from_reader_and_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let payload: Vec<u8> = (0..255).collect();
        {
            let mut file = File::create(&path).unwrap();
            file.write_all(&payload).unwrap();
        }

        let read = ImageBuf::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(read.as_slice(), payload.as_slice());

        let mapped = ImageBuf::map_file(&File::open(&path).unwrap()).unwrap();
        assert_eq!(mapped.as_slice(), payload.as_slice());
    }
}
