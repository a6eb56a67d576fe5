#![forbid(unsafe_code)]
//! Shared memory objects backing regular files.
//!
//! Models the kernel memory primitives the filesystem consumes: allocate a
//! page-granular object, grow it in place, duplicate handles to it, and map
//! views of it. Handles duplicated out of the filesystem (`access_memory`)
//! share the same bytes as the filesystem's own mapping, so a client write
//! through a mapped handle is visible to subsequent file reads.
//!
//! All sizes are whole multiples of [`PAGE_SIZE`]; violating that, or
//! exhausting memory, is fatal here rather than a recoverable error.

use mist_types::{PAGE_SIZE, is_page_aligned};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

struct MemoryObject {
    bytes: RwLock<Vec<u8>>,
}

/// Owner-side handle to a shared memory object.
///
/// Duplicating a handle (`dup`) yields a second handle to the same object,
/// the way a kernel handle table would.
#[derive(Clone)]
pub struct MemHandle {
    object: Arc<MemoryObject>,
}

impl std::fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemHandle").field("len", &self.len()).finish()
    }
}

impl MemHandle {
    /// Allocate a fresh zero-filled object of exactly `len` bytes.
    #[must_use]
    pub fn allocate(len: u64) -> Self {
        assert!(len > 0, "zero-sized memory object");
        assert!(is_page_aligned(len), "allocation must be page-granular");
        debug!(event = "mem_allocate", len);
        Self {
            object: Arc::new(MemoryObject {
                bytes: RwLock::new(vec![0; to_index(len)]),
            }),
        }
    }

    /// Grow the object in place to exactly `new_len` bytes.
    ///
    /// Existing content is preserved; the new tail is zero-filled. Objects
    /// never shrink.
    pub fn grow(&self, new_len: u64) {
        assert!(is_page_aligned(new_len), "growth must be page-granular");
        let mut bytes = self.object.bytes.write();
        let old_len = bytes.len();
        assert!(to_index(new_len) >= old_len, "memory objects never shrink");
        bytes.resize(to_index(new_len), 0);
        debug!(event = "mem_grow", old_len, new_len);
    }

    /// Current size of the object in bytes (always a page multiple).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.object.bytes.read().len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // objects are at least one page
    }

    /// Duplicate this handle. Both handles refer to the same bytes.
    #[must_use]
    pub fn dup(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
        }
    }

    /// Map a view covering `[0, len)` as of this call.
    ///
    /// A mapping does not track later growth of the object; remap after
    /// growing to see the new tail.
    #[must_use]
    pub fn map(&self) -> Mapping {
        Mapping {
            object: Arc::clone(&self.object),
            len: self.len(),
        }
    }

    /// Number of pages currently backing the object.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.len() / PAGE_SIZE
    }
}

/// A view of a shared memory object, fixed to the object's size at map time.
///
/// Accesses beyond the view's length fault (panic), mirroring what a client
/// touching an unmapped page would experience.
pub struct Mapping {
    object: Arc<MemoryObject>,
    len: u64,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

impl Mapping {
    /// Length of the view in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `buf.len()` bytes out of the view starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) {
        let end = offset
            .checked_add(buf.len() as u64)
            .expect("read range overflows");
        assert!(end <= self.len, "read beyond mapped view");
        let bytes = self.object.bytes.read();
        buf.copy_from_slice(&bytes[to_index(offset)..to_index(end)]);
    }

    /// Copy `data` into the view starting at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let end = offset
            .checked_add(data.len() as u64)
            .expect("write range overflows");
        assert!(end <= self.len, "write beyond mapped view");
        let mut bytes = self.object.bytes.write();
        bytes[to_index(offset)..to_index(end)].copy_from_slice(data);
    }
}

fn to_index(value: u64) -> usize {
    usize::try_from(value).expect("offset fits in usize")
}
