//! Shared-memory backing: the only platform-facing seam.
//!
//! The rest of the crate works against [`ShmBacking`], a small
//! capability that creates, opens, and destroys named regions and
//! hands back a [`MappedRegion`]. The default implementation,
//! [`PosixShm`], uses POSIX `shm_open` + `mmap` under `/dev/shm`;
//! nothing outside this module names the platform.

use std::num::NonZeroUsize;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::error::{ShmxError, ShmxResult};

/// SHM object name prefix for all shmx regions.
const SHM_PREFIX: &str = "/shmx_";

/// How a region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Read-write mapping. Clients need this for their reader slot and
    /// control ring even though they never touch frame slots.
    ReadWrite,
    /// Read-only mapping, used by inspectors.
    ReadOnly,
}

/// Provider of named shared-memory regions.
///
/// Create hands back a zeroed region of exactly the requested size;
/// open maps the same bytes at whatever size the region currently has.
/// Unmapping happens when the returned [`MappedRegion`] drops.
pub trait ShmBacking: Send + Sync {
    /// Create a new region of `size` bytes. Fails if a region with
    /// this name already exists.
    fn create(&self, name: &str, size: usize) -> ShmxResult<MappedRegion>;

    /// Map an existing region.
    fn open(&self, name: &str, mode: MapMode) -> ShmxResult<MappedRegion>;

    /// Remove the named region. Existing mappings stay valid until
    /// they unmap; new opens fail.
    fn destroy(&self, name: &str) -> ShmxResult<()>;
}

/// A mapped shared-memory region. Unmaps on drop.
pub struct MappedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
    name: String,
    _fd: OwnedFd,
}

// SAFETY: the mapping itself is freely shareable; all cross-process
// coordination happens through the atomics the region contains.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Base address of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Region name as given to the backing.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.ptr, self.len);
        }
    }
}

/// POSIX shared-memory backing (`shm_open` under `/dev/shm`).
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixShm;

impl PosixShm {
    fn shm_name(name: &str) -> String {
        format!("{SHM_PREFIX}{name}")
    }

    fn os_err(name: &str, op: &'static str, source: nix::errno::Errno) -> ShmxError {
        ShmxError::ShmBackingFailed {
            name: name.to_string(),
            op,
            source,
        }
    }
}

impl ShmBacking for PosixShm {
    fn create(&self, name: &str, size: usize) -> ShmxResult<MappedRegion> {
        let shm_name = Self::shm_name(name);
        let fd = mman::shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| Self::os_err(name, "create", e))?;

        // ftruncate on a fresh object zero-fills the region.
        unistd::ftruncate(&fd, size as libc::off_t).map_err(|e| {
            let _ = mman::shm_unlink(shm_name.as_str());
            Self::os_err(name, "create", e)
        })?;

        let ptr = map_fd(&fd, size, MapMode::ReadWrite).map_err(|e| {
            let _ = mman::shm_unlink(shm_name.as_str());
            Self::os_err(name, "create", e)
        })?;

        Ok(MappedRegion {
            ptr,
            len: size,
            name: name.to_string(),
            _fd: fd,
        })
    }

    fn open(&self, name: &str, mode: MapMode) -> ShmxResult<MappedRegion> {
        let shm_name = Self::shm_name(name);
        let oflag = match mode {
            MapMode::ReadWrite => OFlag::O_RDWR,
            MapMode::ReadOnly => OFlag::O_RDONLY,
        };
        let fd = mman::shm_open(shm_name.as_str(), oflag, Mode::empty())
            .map_err(|e| Self::os_err(name, "open", e))?;

        let stat = nix::sys::stat::fstat(fd.as_raw_fd()).map_err(|e| Self::os_err(name, "open", e))?;
        let len = stat.st_size as usize;

        let ptr = map_fd(&fd, len, mode).map_err(|e| Self::os_err(name, "open", e))?;

        Ok(MappedRegion {
            ptr,
            len,
            name: name.to_string(),
            _fd: fd,
        })
    }

    fn destroy(&self, name: &str) -> ShmxResult<()> {
        let shm_name = Self::shm_name(name);
        mman::shm_unlink(shm_name.as_str()).map_err(|e| Self::os_err(name, "destroy", e))
    }
}

fn map_fd(
    fd: &OwnedFd,
    len: usize,
    mode: MapMode,
) -> Result<NonNull<libc::c_void>, nix::errno::Errno> {
    let prot = match mode {
        MapMode::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapMode::ReadOnly => ProtFlags::PROT_READ,
    };
    let len = NonZeroUsize::new(len).ok_or(nix::errno::Errno::EINVAL)?;
    unsafe { mman::mmap(None, len, prot, MapFlags::MAP_SHARED, fd, 0) }
}
