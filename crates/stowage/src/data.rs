//! Immutable byte blobs backed by owned memory or memory-mapped file
//! regions.
//!
//! A [`Data`] is a logically contiguous sequence of bytes stored as an
//! ordered list of segments, each a subrange of a reference-counted backing
//! buffer. Cloning, subranging, and concatenation never copy payload bytes;
//! consumers that need contiguity copy out explicitly with
//! [`Data::to_vec`].

use memmap2::Mmap;
use std::sync::Arc;

#[derive(Clone)]
enum Source {
    Bytes(Arc<Vec<u8>>),
    Map(Arc<Mmap>),
}

impl Source {
    fn as_slice(&self) -> &[u8] {
        match self {
            Source::Bytes(bytes) => bytes,
            Source::Map(map) => map,
        }
    }
}

#[derive(Clone)]
struct Segment {
    source: Source,
    offset: usize,
    len: usize,
}

impl Segment {
    fn as_slice(&self) -> &[u8] {
        &self.source.as_slice()[self.offset..self.offset + self.len]
    }
}

/// An immutable, cheaply clonable byte blob.
#[derive(Clone, Default)]
pub struct Data {
    segments: Vec<Segment>,
    len: u64,
}

impl Data {
    /// Creates a blob owning the given bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        let len = bytes.len();
        Self {
            segments: vec![Segment {
                source: Source::Bytes(Arc::new(bytes)),
                offset: 0,
                len,
            }],
            len: len as u64,
        }
    }

    /// Creates a blob over a memory-mapped file region.
    ///
    /// The bytes become invalid if the underlying file is modified while
    /// mapped; the storage engine never rewrites a body region in place.
    pub fn from_map(map: Mmap) -> Self {
        let len = map.len();
        if len == 0 {
            return Self::default();
        }
        Self {
            segments: vec![Segment {
                source: Source::Map(Arc::new(map)),
                offset: 0,
                len,
            }],
            len: len as u64,
        }
    }

    /// Returns the logical size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the blob contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the contiguous spans covering the logical bytes, in
    /// order. Hashing and file writes stream over these without copying.
    pub fn spans(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Returns a view of `length` bytes starting at `offset`, without
    /// copying. The range is clamped to the blob's bounds.
    pub fn subrange(&self, offset: u64, length: u64) -> Data {
        let offset = offset.min(self.len);
        let length = length.min(self.len - offset);
        if length == 0 {
            return Data::default();
        }

        let mut segments = Vec::new();
        let mut skip = offset as usize;
        let mut remaining = length as usize;
        for segment in &self.segments {
            if skip >= segment.len {
                skip -= segment.len;
                continue;
            }
            let take = (segment.len - skip).min(remaining);
            segments.push(Segment {
                source: segment.source.clone(),
                offset: segment.offset + skip,
                len: take,
            });
            skip = 0;
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }

        Data { segments, len: length }
    }

    /// Produces the logical concatenation of two blobs without copying.
    pub fn concatenate(a: &Data, b: &Data) -> Data {
        let mut segments = Vec::with_capacity(a.segments.len() + b.segments.len());
        segments.extend(a.segments.iter().cloned());
        segments.extend(b.segments.iter().cloned());
        Data {
            segments,
            len: a.len + b.len,
        }
    }

    /// Copies the logical bytes out into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len as usize);
        for span in self.spans() {
            out.extend_from_slice(span);
        }
        out
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Data::from_vec(bytes)
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Data::from_vec(bytes.to_vec())
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let data = Data::default();
        assert_eq!(data.len(), 0);
        assert!(data.is_empty());
        assert_eq!(data.spans().count(), 0);
        assert!(data.to_vec().is_empty());
    }

    #[test]
    fn test_from_vec_roundtrip() {
        let data = Data::from_vec(vec![1, 2, 3, 4, 5]);
        assert_eq!(data.len(), 5);
        assert_eq!(data.to_vec(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_concatenate_is_zero_copy() {
        let a = Data::from_vec(vec![1, 2, 3]);
        let b = Data::from_vec(vec![4, 5]);
        let joined = Data::concatenate(&a, &b);
        assert_eq!(joined.len(), 5);
        assert_eq!(joined.to_vec(), vec![1, 2, 3, 4, 5]);
        // Two spans, no flattening.
        assert_eq!(joined.spans().count(), 2);
    }

    #[test]
    fn test_subrange_within_single_segment() {
        let data = Data::from_vec((0u8..10).collect());
        let sub = data.subrange(2, 4);
        assert_eq!(sub.to_vec(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_subrange_across_segments() {
        let a = Data::from_vec(vec![0, 1, 2, 3]);
        let b = Data::from_vec(vec![4, 5, 6, 7]);
        let joined = Data::concatenate(&a, &b);

        let sub = joined.subrange(2, 4);
        assert_eq!(sub.to_vec(), vec![2, 3, 4, 5]);
        assert_eq!(sub.spans().count(), 2);

        // Entirely inside the second segment.
        let tail = joined.subrange(5, 3);
        assert_eq!(tail.to_vec(), vec![5, 6, 7]);
        assert_eq!(tail.spans().count(), 1);
    }

    #[test]
    fn test_subrange_clamps_to_bounds() {
        let data = Data::from_vec(vec![1, 2, 3]);
        assert_eq!(data.subrange(1, 100).to_vec(), vec![2, 3]);
        assert!(data.subrange(10, 5).is_empty());
        assert!(data.subrange(3, 0).is_empty());
    }

    #[test]
    fn test_clone_shares_backing() {
        let data = Data::from_vec(vec![0u8; 4096]);
        let clone = data.clone();
        let (a, b) = (data.spans().next().unwrap(), clone.spans().next().unwrap());
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
