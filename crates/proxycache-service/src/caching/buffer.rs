use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A reference-counted byte buffer shared between every holder.
///
/// Cloning is cheap and never copies the bytes. The buffer is immutable unless it is
/// uniquely held, see [`SharedBuffer::is_unique`] and [`SharedBuffer::get_mut`]. Callers
/// that need to modify a shared buffer must make an explicit copy via
/// [`SharedBuffer::to_vec`].
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SharedBuffer {
    inner: Arc<Vec<u8>>,
}

impl SharedBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(bytes.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Whether this is the only handle to the underlying bytes.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Mutable access to the bytes, only available while [`is_unique`](Self::is_unique).
    pub fn get_mut(&mut self) -> Option<&mut Vec<u8>> {
        Arc::get_mut(&mut self.inner)
    }

    /// Copies the bytes out of the buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.as_ref().clone()
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SharedBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for SharedBuffer {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}
