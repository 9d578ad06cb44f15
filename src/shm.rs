// Shared memory module
// Anonymous, unlinked POSIX shared memory regions for wl_shm pools

use crate::error::OverlayError;
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts at finding an unused object name before giving up
const CREATE_ATTEMPTS: usize = 100;

/// Prefix of every shared memory object name
const NAME_PREFIX: &str = "/lwr-shm-";

/// Characters in the random part of the name
const NAME_SUFFIX_LEN: usize = 8;

const NAME_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A mapped shared memory region with no name left in the filesystem.
///
/// Dropping the region unmaps it and closes the descriptor. Objects the
/// compositor created from the descriptor keep the memory alive on their
/// side.
pub struct ShmRegion {
    // Field order matters: unmap before closing the descriptor
    map: MmapMut,
    fd: OwnedFd,
}

impl ShmRegion {
    /// Create and map a writable region of `len` bytes
    pub fn allocate(len: usize) -> Result<Self, OverlayError> {
        if len == 0 {
            return Err(OverlayError::Allocation("zero-sized region".into()));
        }
        if i32::try_from(len).is_err() {
            return Err(OverlayError::Allocation(format!(
                "{len} bytes exceeds the wl_shm pool limit"
            )));
        }

        let fd = create_shm_file()?;
        truncate(&fd, len)?;

        // SAFETY: the object is unlinked, so only descriptors we hand out
        // can reach it, and the compositor never writes to client buffers.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&fd) }
            .map_err(|e| OverlayError::Allocation(format!("mmap of {len} bytes: {e}")))?;

        Ok(Self { map, fd })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }
}

impl AsFd for ShmRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("fd", &self.fd)
            .field("len", &self.map.len())
            .finish()
    }
}

/// Open a fresh shared memory object and drop its name right away
fn create_shm_file() -> Result<OwnedFd, OverlayError> {
    open_with_retries(CREATE_ATTEMPTS, random_name, |name| {
        let fd = shm_open(
            name,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        if let Err(e) = shm_unlink(name) {
            warn!("Failed to unlink shared memory object {}: {}", name, e);
        }
        Ok(fd)
    })
}

/// Try names from `next_name` until `open` succeeds.
///
/// Only a name collision (`EEXIST`) moves on to the next name; any other
/// failure is returned at once.
fn open_with_retries<N, O>(attempts: usize, mut next_name: N, mut open: O) -> Result<OwnedFd, OverlayError>
where
    N: FnMut() -> String,
    O: FnMut(&str) -> nix::Result<OwnedFd>,
{
    for attempt in 1..=attempts {
        let name = next_name();
        match open(&name) {
            Ok(fd) => {
                debug!("Created shared memory object {} (attempt {})", name, attempt);
                return Ok(fd);
            }
            Err(Errno::EEXIST) => debug!("Shared memory name {} is taken", name),
            Err(e) => {
                return Err(OverlayError::Allocation(format!("shm_open {name}: {e}")));
            }
        }
    }

    Err(OverlayError::Allocation(format!(
        "no free shared memory name after {attempts} attempts"
    )))
}

fn truncate(fd: &OwnedFd, len: usize) -> Result<(), OverlayError> {
    loop {
        match ftruncate(fd, len as nix::libc::off_t) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(OverlayError::Allocation(format!("ftruncate to {len} bytes: {e}")));
            }
        }
    }
}

/// `/lwr-shm-` followed by eight characters from a per-process random
/// hasher fed with the clock, the pid and a counter
fn random_name() -> String {
    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.write_u128(nanos);
    hasher.write_u32(std::process::id());
    hasher.write_u64(NAME_COUNTER.fetch_add(1, Ordering::Relaxed));

    let mut bits = hasher.finish();
    let mut name = String::with_capacity(NAME_PREFIX.len() + NAME_SUFFIX_LEN);
    name.push_str(NAME_PREFIX);
    for _ in 0..NAME_SUFFIX_LEN {
        name.push(NAME_ALPHABET[(bits & 31) as usize] as char);
        bits >>= 5;
    }
    name
}
