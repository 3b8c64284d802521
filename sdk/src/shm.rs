use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

use crate::error::RegionError;
use crate::layout::{self, FLAG_PAGE, OFFSET_FLAGS, REGION_SIZE};

enum Backing {
    Mapped(MmapMut),
    Anon(Box<[u8]>),
}

impl Backing {
    fn ptr(&self) -> *mut u8 {
        match self {
            Backing::Mapped(m) => m.as_ptr() as *mut u8,
            Backing::Anon(b) => b.as_ptr() as *mut u8,
        }
    }
}

/// Safe wrapper around the shared mailbox region.
///
/// This struct enforces:
/// 1. Bounds checking on every access
/// 2. Acquire/release fences around bulk copies
/// 3. Atomic flag words with explicit orderings
///
/// The raw pointer below this type is the one unsafe boundary of the
/// transport; everything above it is safe.
#[derive(Clone)]
pub struct SharedRegion {
    backing: Arc<Backing>,
    capacity: usize,
}

// SAFETY: all mutation goes through raw-pointer copies guarded by the flag
// protocol (single producer and single consumer per flag word, fenced on both
// sides) or through AtomicU32 views. The backing mapping itself is shared by
// design, exactly like the underlying OS object.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Open (creating if needed) the POSIX named region and map it.
    pub fn open(name: &str) -> Result<Self, RegionError> {
        let path: PathBuf = ["/dev/shm", name].iter().collect();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| RegionError::Open {
                name: name.to_string(),
                source,
            })?;
        file.set_len(REGION_SIZE as u64)
            .map_err(|source| RegionError::Open {
                name: name.to_string(),
                source,
            })?;
        // SAFETY: the file is sized above; concurrent mappings of the region
        // are coordinated by the flag protocol.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| RegionError::Map {
            name: name.to_string(),
            source,
        })?;
        log::info!("mapped shared region {} ({} bytes)", name, REGION_SIZE);
        Ok(Self {
            backing: Arc::new(Backing::Mapped(map)),
            capacity: REGION_SIZE,
        })
    }

    /// Heap-backed region with the standard layout. For in-process use and
    /// tests; clones share the same storage.
    pub fn anonymous() -> Self {
        Self {
            backing: Arc::new(Backing::Anon(vec![0u8; REGION_SIZE].into_boxed_slice())),
            capacity: REGION_SIZE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bounds_check(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        if offset.checked_add(len).map_or(true, |end| end > self.capacity) {
            return Err(RegionError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Bulk read with an acquire fence before the copy.
    pub fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), RegionError> {
        self.bounds_check(offset, dest.len())?;
        fence(Ordering::Acquire);
        // SAFETY: bounds checked above; source and dest never overlap because
        // dest is a private buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.backing.ptr().add(offset),
                dest.as_mut_ptr(),
                dest.len(),
            );
        }
        Ok(())
    }

    /// Bulk write with a release fence after the copy.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), RegionError> {
        self.bounds_check(offset, data.len())?;
        // SAFETY: bounds checked above; see type-level SAFETY note.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.backing.ptr().add(offset), data.len());
        }
        fence(Ordering::Release);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, RegionError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegionError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Atomic view of worker `id`'s flag word.
    pub fn flag(&self, id: usize) -> Result<&AtomicU32, RegionError> {
        if id >= layout::MAX_WORKERS {
            return Err(RegionError::BadWorker(id, layout::MAX_WORKERS));
        }
        let offset = OFFSET_FLAGS + id * FLAG_PAGE;
        debug_assert_eq!(offset % 4, 0);
        // SAFETY: offset is in bounds and 4-byte aligned (the mapping is page
        // aligned); AtomicU32 has no validity requirements beyond that. The
        // returned reference borrows self, so the mapping outlives it.
        Ok(unsafe { &*(self.backing.ptr().add(offset) as *const AtomicU32) })
    }
}
