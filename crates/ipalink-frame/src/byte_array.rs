use std::fmt;
use std::ops::Deref;

use bytes::{Bytes, BytesMut};

/// Owned, growable byte buffer used as the unit of transport data.
///
/// Cloning copies the bytes: a clone never aliases its source, so mutating
/// one never shows up in the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteArray {
    inner: BytesMut,
}

impl ByteArray {
    /// Initial allocation used by [`ByteArray::new`].
    pub const DEFAULT_SIZE_HINT: usize = 1024;

    /// Create an empty array with the default size hint reserved.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_SIZE_HINT)
    }

    /// Create an empty array with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Append a run of bytes.
    pub fn append(&mut self, bytes: impl AsRef<[u8]>) {
        self.inner.extend_from_slice(bytes.as_ref());
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) {
        self.inner.extend_from_slice(&[byte]);
    }

    /// Drop all bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Bytes that can be held without reallocating.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Read-only view of the contents, valid until the next mutation.
    pub fn data(&self) -> &[u8] {
        &self.inner
    }

    /// Position of the first occurrence of `byte`, if any.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.inner.iter().position(|b| *b == byte)
    }

    /// Convert into an immutable, cheaply cloneable [`Bytes`].
    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.inner.to_vec()
    }

    /// Split off the first `at` bytes, leaving the remainder in `self`.
    pub(crate) fn split_to(&mut self, at: usize) -> ByteArray {
        ByteArray {
            inner: self.inner.split_to(at),
        }
    }
}

impl Deref for ByteArray {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for ByteArray {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

/// Renders the raw bytes as text without escaping. Invalid UTF-8 sequences
/// are replaced with U+FFFD.
impl fmt::Display for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.inner))
    }
}

impl From<&[u8]> for ByteArray {
    fn from(bytes: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(bytes),
        }
    }
}

impl<const N: usize> From<&[u8; N]> for ByteArray {
    fn from(bytes: &[u8; N]) -> Self {
        Self::from(&bytes[..])
    }
}

impl From<&str> for ByteArray {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl From<Vec<u8>> for ByteArray {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            inner: BytesMut::from(&bytes[..]),
        }
    }
}

impl From<Bytes> for ByteArray {
    fn from(bytes: Bytes) -> Self {
        Self::from(bytes.as_ref())
    }
}

impl From<BytesMut> for ByteArray {
    fn from(inner: BytesMut) -> Self {
        Self { inner }
    }
}

impl From<ByteArray> for Bytes {
    fn from(array: ByteArray) -> Self {
        array.freeze()
    }
}

impl Extend<u8> for ByteArray {
    fn extend<I: IntoIterator<Item = u8>>(&mut self, iter: I) {
        self.inner.extend(iter);
    }
}

impl PartialEq<[u8]> for ByteArray {
    fn eq(&self, other: &[u8]) -> bool {
        self.inner.as_ref() == other
    }
}

impl PartialEq<&[u8]> for ByteArray {
    fn eq(&self, other: &&[u8]) -> bool {
        self.inner.as_ref() == *other
    }
}

impl PartialEq<str> for ByteArray {
    fn eq(&self, other: &str) -> bool {
        self.inner.as_ref() == other.as_bytes()
    }
}

impl PartialEq<&str> for ByteArray {
    fn eq(&self, other: &&str) -> bool {
        self.inner.as_ref() == other.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_push_and_clear() {
        let mut array = ByteArray::from("111");
        assert_eq!(array.to_string(), "111");
        assert_eq!(array.len(), 3);

        array.append(ByteArray::from("222"));
        assert_eq!(array.to_string(), "111222");
        assert_eq!(array.len(), 6);

        array.push(b'3');
        assert_eq!(array.len(), 7);
        assert_eq!(array.to_string(), "1112223");
        assert_eq!(array.data()[6], b'3');

        array.clear();
        assert_eq!(array.len(), 0);
        assert!(array.is_empty());
        assert_eq!(array.to_string(), "");
    }

    #[test]
    fn clear_keeps_allocation() {
        let mut array = ByteArray::with_capacity(64);
        array.append([0xAB; 48]);
        let before = array.capacity();
        array.clear();
        assert_eq!(array.capacity(), before);
        assert!(array.is_empty());
    }

    #[test]
    fn clone_is_independent() {
        let original = ByteArray::from("abc");
        let mut copy = original.clone();

        copy.append("def");
        copy.push(b'!');
        assert_eq!(original.len(), 3);
        assert_eq!(original.data(), b"abc");
        assert_eq!(copy, "abcdef!");

        copy.clear();
        assert_eq!(original, "abc");
    }

    #[test]
    fn to_string_does_not_escape() {
        let array = ByteArray::from(&b"line\n\ttab\x17"[..]);
        assert_eq!(array.to_string(), "line\n\ttab\u{17}");
    }

    #[test]
    fn to_string_is_lossy_for_invalid_utf8() {
        let array = ByteArray::from(vec![b'o', b'k', 0xFF]);
        assert_eq!(array.to_string(), "ok\u{FFFD}");
    }

    #[test]
    fn find_locates_first_match() {
        let array = ByteArray::from("a\x17b\x17");
        assert_eq!(array.find(0x17), Some(1));
        assert_eq!(array.find(b'z'), None);
    }

    #[test]
    fn split_to_leaves_remainder() {
        let mut array = ByteArray::from("headtail");
        let head = array.split_to(4);
        assert_eq!(head, "head");
        assert_eq!(array, "tail");
    }

    #[test]
    fn freeze_preserves_contents() {
        let mut array = ByteArray::new();
        array.extend(b"xyz".iter().copied());
        let bytes: Bytes = array.into();
        assert_eq!(bytes.as_ref(), b"xyz");
    }
}
