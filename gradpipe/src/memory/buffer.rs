//! Sized views over host memory the backend does not own.
//!
//! Zero-cost wrapper around a raw `u64` pointer plus a byte length, matching
//! how stage workers and device adapters exchange addresses.

/// A sized host memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRegion {
    ptr: u64,
    len_bytes: usize,
}

impl HostRegion {
    /// Create a new region.
    ///
    /// # Safety
    /// `ptr` must point to at least `len_bytes` of valid host memory that
    /// outlives every use of the region.
    pub unsafe fn new(ptr: u64, len_bytes: usize) -> Self {
        Self { ptr, len_bytes }
    }

    /// Region over a byte slice. The caller keeps the slice alive.
    ///
    /// # Safety
    /// The slice must outlive every use of the region, including by stage
    /// workers that receive it through a task.
    pub unsafe fn from_slice(data: &mut [u8]) -> Self {
        Self {
            ptr: data.as_mut_ptr() as u64,
            len_bytes: data.len(),
        }
    }

    /// Get the raw `u64` pointer.
    pub fn as_u64(&self) -> u64 {
        self.ptr
    }

    /// Size of the region in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    /// Returns true if the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    /// Sub-region `[offset, offset + len)`, or `None` if out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<HostRegion> {
        let end = offset.checked_add(len)?;
        if end > self.len_bytes {
            return None;
        }
        Some(HostRegion {
            ptr: self.ptr + offset as u64,
            len_bytes: len,
        })
    }

    /// Borrow the region's bytes.
    ///
    /// # Safety
    /// No other thread may write to the region while the slice is alive.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.len_bytes == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len_bytes) }
    }
}

impl std::fmt::Display for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostRegion(0x{:x}, {}B)", self.ptr, self.len_bytes)
    }
}
