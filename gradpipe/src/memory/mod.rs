mod buffer;
mod shm;

pub use buffer::HostRegion;
pub use shm::{MmapSharedMemory, SharedBuffer, SharedMemory};
