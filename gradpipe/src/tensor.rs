use crate::types::DataType;

/// A framework tensor handed to the backend.
///
/// The backend never dereferences `data()`; it only forwards the address to
/// stage workers, which know which device it lives on.
pub trait Tensor: Send + Sync {
    fn dtype(&self) -> DataType;

    /// Address of the first byte.
    fn data(&self) -> u64;

    /// Size in bytes.
    fn size(&self) -> usize;
}

/// Signals when the producer of a tensor (e.g. a compute stream) finished
/// writing it. Device-to-host workers poll this before copying.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

/// An owned host tensor.
pub struct HostTensor {
    dtype: DataType,
    data: Box<[u8]>,
}

impl HostTensor {
    pub fn new(dtype: DataType, data: Vec<u8>) -> Self {
        Self {
            dtype,
            data: data.into_boxed_slice(),
        }
    }

    /// Zero-filled tensor of `count` elements.
    pub fn zeros(dtype: DataType, count: usize) -> Self {
        Self::new(dtype, vec![0; count * dtype.size_in_bytes()])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Tensor for HostTensor {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn data(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}
