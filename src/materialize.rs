// This module turns finished code bytes into something the test can call. make_executable maps
// a fresh anonymous region rounded up to whole pages, copies the bytes in while the region is
// writable, switches it to read+execute and synchronizes the instruction cache where the
// architecture requires it. The resulting ExecutableBlock owns its mapping and unmaps it on
// drop, independently of the arena chunk the bytes came from. EntryPoint is the value stored in
// a method's entry-point slot: either the interpreter (no compiled code) or the address of
// compiled code. OatMethod is the non-owning pairing of a raw code pointer with a method, used by
// tests that want a "compiled" method without running a backend; like a method inside a loaded
// image it is expressed as a begin address plus a non-zero code offset.

//! Executable mappings and entry points.

use crate::core::error::{HarnessError, HarnessResult};
use crate::core::isa::InstructionSet;
use crate::core::reservation::page_size;
use crate::runtime::MethodDef;
use std::ptr::NonNull;

/// Where a call to a method lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Interpreter,
    Compiled(usize),
}

impl EntryPoint {
    pub fn from_raw(raw: usize) -> Self {
        match raw {
            0 => EntryPoint::Interpreter,
            address => EntryPoint::Compiled(address),
        }
    }

    pub fn to_raw(self) -> usize {
        match self {
            EntryPoint::Interpreter => 0,
            EntryPoint::Compiled(address) => address,
        }
    }

    pub fn address(self) -> Option<usize> {
        match self {
            EntryPoint::Interpreter => None,
            EntryPoint::Compiled(address) => Some(address),
        }
    }
}

/// A read+execute mapping holding a copy of some code.
#[derive(Debug)]
pub struct ExecutableBlock {
    ptr: NonNull<u8>,
    len: usize,
    mapping_len: usize,
}

// SAFETY: the mapping is immutable once created and owned by the block.
unsafe impl Send for ExecutableBlock {}
unsafe impl Sync for ExecutableBlock {}

impl ExecutableBlock {
    /// Address of the first copied byte.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Number of bytes copied in.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying mapping, a whole number of pages.
    pub fn mapping_len(&self) -> usize {
        self.mapping_len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the first `len` bytes of the mapping were initialized and
        // the mapping stays readable until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.address() && address < self.address() + self.len
    }
}

impl Drop for ExecutableBlock {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `make_executable` with this length.
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.mapping_len) };
        if result != 0 {
            log::warn!(
                "munmap of executable block at {:p} failed: {}",
                self.ptr,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Copy `code` into a new executable mapping.
pub fn make_executable(code: &[u8]) -> HarnessResult<ExecutableBlock> {
    if code.is_empty() {
        return Err(HarnessError::materialization("no code to make executable"));
    }
    let mapping_len = code.len().next_multiple_of(page_size());

    // SAFETY: anonymous private mapping at a kernel-chosen address.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mapping_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(HarnessError::materialization(format!(
            "mmap of {mapping_len} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let ptr = NonNull::new(raw.cast::<u8>())
        .ok_or_else(|| HarnessError::materialization("mmap returned a null mapping"))?;
    // From here on dropping `block` unmaps the region.
    let block = ExecutableBlock {
        ptr,
        len: code.len(),
        mapping_len,
    };

    // SAFETY: the mapping is writable and at least `code.len()` bytes long.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), block.ptr.as_ptr(), code.len());
    }

    // SAFETY: changes the protection of the mapping created above.
    let result = unsafe {
        libc::mprotect(raw, mapping_len, libc::PROT_READ | libc::PROT_EXEC)
    };
    if result != 0 {
        return Err(HarnessError::materialization(format!(
            "mprotect(PROT_READ | PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    flush_instruction_cache(block.address(), block.len());
    log::debug!(
        "Made {} bytes executable at {:#x} ({} byte mapping)",
        block.len(),
        block.address(),
        mapping_len
    );
    Ok(block)
}

#[cfg(target_arch = "aarch64")]
fn flush_instruction_cache(start: usize, len: usize) {
    use std::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from user space on every supported OS.
    unsafe { asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dcache_line = 4usize << ((ctr >> 16) & 0xf);
    let icache_line = 4usize << (ctr & 0xf);
    let end = start + len;

    // SAFETY: cache maintenance on addresses inside a live mapping.
    unsafe {
        let mut addr = start & !(dcache_line - 1);
        while addr < end {
            asm!("dc cvau, {0}", in(reg) addr, options(nostack));
            addr += dcache_line;
        }
        asm!("dsb ish", options(nostack));
        let mut addr = start & !(icache_line - 1);
        while addr < end {
            asm!("ic ivau, {0}", in(reg) addr, options(nostack));
            addr += icache_line;
        }
        asm!("dsb ish", options(nostack));
        asm!("isb", options(nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_instruction_cache(_start: usize, _len: usize) {}

/// A raw code pointer presented the way a method inside a loaded image is.
///
/// The harness does not own the memory behind the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OatMethod {
    begin: usize,
    code_offset: u32,
}

impl OatMethod {
    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn code_offset(&self) -> u32 {
        self.code_offset
    }

    pub fn code_pointer(&self) -> usize {
        self.begin + self.code_offset as usize
    }

    /// Bind the code pointer as `method`'s entry point.
    pub fn link_method(&self, method: &MethodDef, isa: InstructionSet) {
        method.set_entry_point(EntryPoint::Compiled(isa.code_pointer(self.code_pointer())));
    }
}

/// Describe `code` as a method at one pointer width past the image begin.
pub fn create_oat_method(code: *const u8) -> HarnessResult<OatMethod> {
    if code.is_null() {
        return Err(HarnessError::materialization("null code pointer"));
    }
    let code_offset = std::mem::size_of::<usize>();
    let begin = (code as usize).checked_sub(code_offset).ok_or_else(|| {
        HarnessError::materialization(format!("code pointer {code:p} is below the pointer width"))
    })?;
    Ok(OatMethod {
        begin,
        code_offset: code_offset as u32,
    })
}
