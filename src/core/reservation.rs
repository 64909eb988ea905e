// This module reserves the virtual address range a loaded ahead-of-time image would occupy.
// Compiled code can embed addresses relative to where the image is expected to live, so tests
// pin that range up front: ImageReservation maps an inaccessible anonymous region at a fixed
// base address and keeps it until released. Only one reservation may exist per process; the
// active base is tracked in a process-wide atomic so that a second reserve call is rejected with
// AlreadyReserved instead of silently mapping elsewhere. On Linux the fixed mapping uses
// MAP_FIXED_NOREPLACE; elsewhere the base is passed as a hint and the result is checked, and in
// both cases a mapping that lands anywhere but the requested base is undone and reported as
// OutOfAddressSpace. Releasing an inactive reservation is a no-op, and dropping an active one
// releases it.

//! Fixed-address image space reservation.

use super::error::{HarnessError, HarnessResult};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Base address at which the harness reserves image space.
pub const IMAGE_BASE_ADDRESS: usize = 0x7000_0000;

/// Default reservation size, 120 MiB.
pub const DEFAULT_IMAGE_RESERVATION_SIZE: usize = 120 * 1024 * 1024;

/// Base of the active reservation, zero when none is active.
static ACTIVE_BASE: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_os = "linux")]
const FIXED_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const FIXED_FLAGS: libc::c_int = 0;

/// Whether any reservation is active in this process.
pub fn is_reservation_active() -> bool {
    ACTIVE_BASE.load(Ordering::Acquire) != 0
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// An inaccessible mapping pinned at a fixed address.
///
/// Callers serialize `reserve` and `release`; the process-wide flag only
/// guarantees that two reservations never coexist.
#[derive(Debug)]
pub struct ImageReservation {
    base: usize,
    size: usize,
    active: bool,
}

impl ImageReservation {
    /// Reserve `size` bytes at [`IMAGE_BASE_ADDRESS`].
    pub fn reserve(size: usize) -> HarnessResult<Self> {
        Self::reserve_at(IMAGE_BASE_ADDRESS, size)
    }

    /// Reserve `size` bytes (rounded up to whole pages) at `base`.
    pub fn reserve_at(base: usize, size: usize) -> HarnessResult<Self> {
        let page = page_size();
        if base == 0 || base % page != 0 {
            return Err(HarnessError::configuration(format!(
                "image base {base:#x} is not a non-null page-aligned address"
            )));
        }
        if size == 0 {
            return Err(HarnessError::configuration("image reservation size must be non-zero"));
        }
        let size = size.next_multiple_of(page);

        if let Err(active) =
            ACTIVE_BASE.compare_exchange(0, base, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(HarnessError::AlreadyReserved { base: active });
        }

        match map_fixed(base, size) {
            Ok(()) => {
                log::info!("Reserved image space {:#x}..{:#x}", base, base + size);
                Ok(Self {
                    base,
                    size,
                    active: true,
                })
            }
            Err(reason) => {
                ACTIVE_BASE.store(0, Ordering::Release);
                Err(HarnessError::OutOfAddressSpace { base, size, reason })
            }
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn contains(&self, address: usize) -> bool {
        self.active && address >= self.base && address < self.base + self.size
    }

    /// Unmap the region. Does nothing if the region was already released.
    pub fn release(&mut self) {
        if !self.active {
            log::debug!("Release of inactive image reservation at {:#x} ignored", self.base);
            return;
        }
        // SAFETY: the range was mapped by `map_fixed` and is owned by this value.
        let result = unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
        if result != 0 {
            log::warn!(
                "munmap of image reservation at {:#x} failed: {}",
                self.base,
                std::io::Error::last_os_error()
            );
        }
        self.active = false;
        ACTIVE_BASE.store(0, Ordering::Release);
        log::info!("Released image space at {:#x}", self.base);
    }
}

impl Drop for ImageReservation {
    fn drop(&mut self) {
        self.release();
    }
}

fn map_fixed(base: usize, size: usize) -> Result<(), String> {
    // SAFETY: an anonymous PROT_NONE mapping; MAP_FIXED is never used, so no
    // existing mapping can be replaced.
    let ptr = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | FIXED_FLAGS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().to_string());
    }
    if ptr as usize != base {
        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        // SAFETY: `ptr` is the mapping just created above.
        unsafe { libc::munmap(ptr, size) };
        return Err(format!("address range is in use, kernel offered {:#x}", ptr as usize));
    }
    Ok(())
}
