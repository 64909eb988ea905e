// This module provides the address-stable storage for compiled methods. CodeBufferArena copies
// each method's side table and code into a single chunk allocated from a bumpalo arena; bumpalo
// grows by adding new blocks and never moves existing allocations, so a chunk's address stays
// valid for as long as the arena lives, no matter how many chunks follow it. A chunk is laid out
// as [side table][padding][method header][code] with the code aligned to the target's code
// alignment and the 8-byte header (offset back to the side table, code size) immediately before
// the code, mirroring how a loaded image places a method header in front of its code. Callers
// refer to chunks through small ChunkHandle values; handles carry the issuing arena's id and its
// generation, so a handle presented to another arena or kept across clear() is rejected instead
// of resolving to an unrelated chunk. Chunks are never mutated after they
// are written and can only be freed all together.

//! Address-stable storage for compiled code chunks.

use super::error::{HarnessError, HarnessResult};
use super::isa::InstructionSet;
use bumpalo::Bump;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

/// Size of the header placed immediately before a method's code.
pub const METHOD_HEADER_SIZE: usize = 8;

/// Header stored in front of every method's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    /// Distance from the start of the code back to the side table, zero when
    /// the method has no side table.
    pub code_info_offset: u32,
    pub code_size: u32,
}

impl MethodHeader {
    fn to_bytes(self) -> [u8; METHOD_HEADER_SIZE] {
        let mut bytes = [0u8; METHOD_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.code_info_offset.to_le_bytes());
        bytes[4..].copy_from_slice(&self.code_size.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut offset = [0u8; 4];
        let mut size = [0u8; 4];
        offset.copy_from_slice(&bytes[..4]);
        size.copy_from_slice(&bytes[4..METHOD_HEADER_SIZE]);
        Self {
            code_info_offset: u32::from_le_bytes(offset),
            code_size: u32::from_le_bytes(size),
        }
    }
}

/// Reference to a chunk owned by a [`CodeBufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle {
    arena: u32,
    generation: u32,
    index: u32,
}

impl ChunkHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Id of the arena that issued the handle.
    pub fn arena_id(&self) -> u32 {
        self.arena
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    base: NonNull<u8>,
    size: usize,
    code_offset: usize,
    code_size: usize,
    side_table_size: usize,
}

/// Borrowed view of one finalized chunk.
#[derive(Debug, Clone, Copy)]
pub struct CodeChunk<'a> {
    bytes: &'a [u8],
    code_offset: usize,
    code_size: usize,
    side_table_size: usize,
}

impl<'a> CodeChunk<'a> {
    /// The whole chunk: side table, padding, header and code.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn code(&self) -> &'a [u8] {
        &self.bytes[self.code_offset..self.code_offset + self.code_size]
    }

    pub fn side_table(&self) -> &'a [u8] {
        &self.bytes[..self.side_table_size]
    }

    pub fn header(&self) -> MethodHeader {
        MethodHeader::from_bytes(&self.bytes[self.code_offset - METHOD_HEADER_SIZE..])
    }

    /// Offset of the first instruction from the start of the chunk.
    pub fn code_offset(&self) -> usize {
        self.code_offset
    }

    pub fn code_ptr(&self) -> *const u8 {
        self.code().as_ptr()
    }

    /// Address of the start of the chunk.
    pub fn address(&self) -> usize {
        self.bytes.as_ptr() as usize
    }
}

/// Append-only arena of compiled code chunks.
pub struct CodeBufferArena {
    bump: Bump,
    chunks: Vec<ChunkRecord>,
    alignment: usize,
    id: u32,
    generation: u32,
}

// SAFETY: the raw chunk pointers only point into memory owned by `bump`, which
// moves together with the arena.
unsafe impl Send for CodeBufferArena {}

impl CodeBufferArena {
    /// Arena laying out code with the alignment `isa` requires.
    pub fn new(isa: InstructionSet) -> Self {
        Self::with_alignment(isa.code_alignment())
    }

    /// Arena with an explicit code alignment, rounded up to a power of two.
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            bump: Bump::new(),
            chunks: Vec::new(),
            alignment: alignment.max(1).next_power_of_two(),
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Process-unique id stamped into every handle this arena issues.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether `handle` was issued by this arena since its last `clear()`.
    pub fn owns(&self, handle: ChunkHandle) -> bool {
        handle.arena == self.id
            && handle.generation == self.generation
            && handle.index() < self.chunks.len()
    }

    /// Copy `code` and `side_table` into a new chunk.
    pub fn allocate(&mut self, code: &[u8], side_table: &[u8]) -> HarnessResult<ChunkHandle> {
        let code_offset = (side_table.len() + METHOD_HEADER_SIZE).next_multiple_of(self.alignment);
        let size = code_offset + code.len();
        let layout = Layout::from_size_align(size, self.alignment).map_err(|_| {
            HarnessError::ArenaLayout {
                size,
                alignment: self.alignment,
            }
        })?;
        let index = u32::try_from(self.chunks.len()).map_err(|_| HarnessError::ArenaLayout {
            size,
            alignment: self.alignment,
        })?;

        let header = MethodHeader {
            code_info_offset: if side_table.is_empty() {
                0
            } else {
                code_offset as u32
            },
            code_size: code.len() as u32,
        };

        let base = self.bump.alloc_layout(layout);
        // SAFETY: `base` points to `size` freshly allocated bytes that nothing
        // else references yet; every write below stays inside that range.
        unsafe {
            let dst = base.as_ptr();
            std::ptr::copy_nonoverlapping(side_table.as_ptr(), dst, side_table.len());
            let padding = code_offset - METHOD_HEADER_SIZE - side_table.len();
            std::ptr::write_bytes(dst.add(side_table.len()), 0, padding);
            let header_bytes = header.to_bytes();
            std::ptr::copy_nonoverlapping(
                header_bytes.as_ptr(),
                dst.add(code_offset - METHOD_HEADER_SIZE),
                METHOD_HEADER_SIZE,
            );
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst.add(code_offset), code.len());
        }

        self.chunks.push(ChunkRecord {
            base,
            size,
            code_offset,
            code_size: code.len(),
            side_table_size: side_table.len(),
        });
        log::trace!(
            "Allocated chunk {} at {:p}: {} code bytes, {} side table bytes",
            index,
            base.as_ptr(),
            code.len(),
            side_table.len()
        );

        Ok(ChunkHandle {
            arena: self.id,
            generation: self.generation,
            index,
        })
    }

    /// Look up a chunk; `None` for handles from another arena or generation.
    pub fn chunk(&self, handle: ChunkHandle) -> Option<CodeChunk<'_>> {
        if !self.owns(handle) {
            return None;
        }
        let record = self.chunks.get(handle.index())?;
        // SAFETY: the record describes an initialized allocation in `bump`,
        // which is only reset through `clear(&mut self)`.
        let bytes = unsafe { std::slice::from_raw_parts(record.base.as_ptr(), record.size) };
        Some(CodeChunk {
            bytes,
            code_offset: record.code_offset,
            code_size: record.code_size,
            side_table_size: record.side_table_size,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkHandle, CodeChunk<'_>)> + '_ {
        (0..self.chunks.len()).filter_map(move |index| {
            let handle = ChunkHandle {
                arena: self.id,
                generation: self.generation,
                index: index as u32,
            };
            self.chunk(handle).map(|chunk| (handle, chunk))
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes currently held by the underlying arena.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Free every chunk at once and invalidate outstanding handles.
    pub fn clear(&mut self) {
        log::debug!("Clearing code arena with {} chunks", self.chunks.len());
        self.chunks.clear();
        self.bump.reset();
        self.generation = self.generation.wrapping_add(1);
    }
}

impl Default for CodeBufferArena {
    fn default() -> Self {
        Self::with_alignment(16)
    }
}

impl std::fmt::Debug for CodeBufferArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBufferArena")
            .field("chunks", &self.chunks.len())
            .field("alignment", &self.alignment)
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
