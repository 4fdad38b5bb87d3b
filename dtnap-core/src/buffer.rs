//! Receive buffer: inline storage for small messages, heap for the rest.

use std::fmt;
use std::ops::Deref;

/// Messages up to this many bytes are copied into inline storage.
pub const INLINE_CAPACITY: usize = 1024;

#[allow(clippy::large_enum_variant)]
pub enum RxBuffer {
    Inline {
        data: [u8; INLINE_CAPACITY],
        len: usize,
    },
    Heap(Vec<u8>),
}

impl RxBuffer {
    /// Zeroed storage for a message of `len` bytes.
    pub fn with_len(len: usize) -> Self {
        if len <= INLINE_CAPACITY {
            RxBuffer::Inline {
                data: [0u8; INLINE_CAPACITY],
                len,
            }
        } else {
            RxBuffer::Heap(vec![0u8; len])
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, RxBuffer::Inline { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            RxBuffer::Inline { len, .. } => *len,
            RxBuffer::Heap(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            RxBuffer::Inline { data, len } => &data[..*len],
            RxBuffer::Heap(v) => v,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            RxBuffer::Inline { data, len } => &mut data[..*len],
            RxBuffer::Heap(v) => v,
        }
    }

    /// Shrink to `n` bytes when the engine read less than announced.
    pub(crate) fn truncate(&mut self, n: usize) {
        match self {
            RxBuffer::Inline { len, .. } => *len = (*len).min(n),
            RxBuffer::Heap(v) => v.truncate(n),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            RxBuffer::Inline { data, len } => data[..len].to_vec(),
            RxBuffer::Heap(v) => v,
        }
    }
}

impl Deref for RxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for RxBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxBuffer")
            .field("len", &self.len())
            .field("inline", &self.is_inline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_boundary() {
        assert!(RxBuffer::with_len(INLINE_CAPACITY).is_inline());
        assert!(!RxBuffer::with_len(INLINE_CAPACITY + 1).is_inline());
        assert!(RxBuffer::with_len(0).is_inline());
    }

    #[test]
    fn truncate_and_into_vec() {
        let mut b = RxBuffer::with_len(10);
        b.as_mut_slice().copy_from_slice(b"0123456789");
        b.truncate(4);
        assert_eq!(b.len(), 4);
        assert_eq!(&*b, b"0123");
        assert_eq!(b.into_vec(), b"0123".to_vec());

        let mut h = RxBuffer::with_len(2000);
        h.as_mut_slice()[0] = 7;
        h.truncate(1);
        assert_eq!(h.into_vec(), vec![7]);
    }

    #[test]
    fn truncate_never_grows() {
        let mut b = RxBuffer::with_len(3);
        b.truncate(100);
        assert_eq!(b.len(), 3);
    }
}
