//! Shared host buffers backing every partition of a tensor.
//!
//! Processes on the same machine open the same segment by key, so the root
//! device's host copy is visible to its local peers without another copy.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{GradpipeError, Result};
use crate::memory::HostRegion;
use crate::types::Key;

/// Provider of keyed shared host memory.
pub trait SharedMemory: Send + Sync {
    /// Open (creating if needed) the segment for `key`, at least `size` bytes.
    fn open_shared_memory(&self, key: Key, size: usize) -> Result<SharedBuffer>;

    /// Open one segment per PCIe switch for `key`.
    ///
    /// The last element is used as the tensor's primary host buffer.
    fn open_pcie_shared_memory(&self, key: Key, size: usize) -> Result<Vec<SharedBuffer>>;
}

struct Segment {
    path: PathBuf,
    ptr: u64,
    len: usize,
    _mmap: MmapMut,
}

/// A mapped shared segment. Clones share the mapping; the last drop unmaps.
#[derive(Clone)]
pub struct SharedBuffer {
    segment: Arc<Segment>,
}

impl SharedBuffer {
    /// The whole mapped region.
    pub fn region(&self) -> HostRegion {
        // SAFETY: the mapping lives as long as `self.segment`, and every
        // holder of the region also holds a clone of this buffer.
        unsafe { HostRegion::new(self.segment.ptr, self.segment.len) }
    }

    pub fn len(&self) -> usize {
        self.segment.len
    }

    pub fn is_empty(&self) -> bool {
        self.segment.len == 0
    }

    /// Backing file of the segment.
    pub fn path(&self) -> &Path {
        &self.segment.path
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("path", &self.segment.path)
            .field("len", &self.segment.len)
            .finish()
    }
}

/// File-backed shared memory under a directory (`/dev/shm` by default).
///
/// Segments opened through one provider are cached by file name, so opening
/// the same key twice yields the same mapping. Files this provider created
/// are unlinked when it is dropped; existing mappings stay valid.
pub struct MmapSharedMemory {
    dir: PathBuf,
    num_pcie_switches: usize,
    segments: Mutex<HashMap<String, SharedBuffer>>,
    created: Mutex<Vec<PathBuf>>,
}

impl MmapSharedMemory {
    pub fn new(dir: impl Into<PathBuf>, num_pcie_switches: usize) -> Self {
        Self {
            dir: dir.into(),
            num_pcie_switches: num_pcie_switches.max(1),
            segments: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    fn open_named(&self, key: Key, name: String, size: usize) -> Result<SharedBuffer> {
        if size == 0 {
            return Err(GradpipeError::Shm {
                key,
                reason: "zero-sized segment".into(),
            });
        }

        let mut segments = self
            .segments
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("shm segments"))?;
        if let Some(buf) = segments.get(&name) {
            if buf.len() < size {
                return Err(GradpipeError::Shm {
                    key,
                    reason: format!("segment {name} is {} bytes, need {size}", buf.len()),
                });
            }
            return Ok(buf.clone());
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(&name);
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let ptr = mmap.as_mut_ptr() as u64;
        let buf = SharedBuffer {
            segment: Arc::new(Segment {
                path: path.clone(),
                ptr,
                len: size,
                _mmap: mmap,
            }),
        };

        if !existed {
            self.created
                .lock()
                .map_err(|_| GradpipeError::LockPoisoned("shm created"))?
                .push(path);
        }
        tracing::trace!(key, size, segment = %name, "opened shared memory");
        segments.insert(name, buf.clone());
        Ok(buf)
    }
}

impl SharedMemory for MmapSharedMemory {
    fn open_shared_memory(&self, key: Key, size: usize) -> Result<SharedBuffer> {
        self.open_named(key, format!("gradpipe_shm_{key}"), size)
    }

    fn open_pcie_shared_memory(&self, key: Key, size: usize) -> Result<Vec<SharedBuffer>> {
        (0..self.num_pcie_switches)
            .map(|i| self.open_named(key, format!("gradpipe_pcie_shm_{key}_{i}"), size))
            .collect()
    }
}

impl Drop for MmapSharedMemory {
    fn drop(&mut self) {
        let created = match self.created.get_mut() {
            Ok(created) => std::mem::take(created),
            Err(_) => return,
        };
        for path in created {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), "failed to unlink shm segment: {e}");
            }
        }
    }
}
