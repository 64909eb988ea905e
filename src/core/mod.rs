// This module gathers the harness infrastructure that every other layer builds on: the error
// type, instruction set selection and feature profiles, compiler configuration and the
// verification registry, the bump-allocated code arena that keeps compiled chunks at stable
// addresses, and the process-wide image address-space reservation.

//! Core harness infrastructure.
//!
//! # Key Components
//!
//! ## Instruction sets (`isa`)
//! - Host instruction set detection and the ARM to Thumb-2 adjustment
//! - Feature variants parsed from `variant,+feature,-feature` strings
//!
//! ## Configuration (`options`)
//! - Compiler filters, backend kinds and profile data
//! - `CompilerConfigBuilder` and the shared `VerificationResults`
//!
//! ## Code storage (`arena`, `reservation`)
//! - `CodeBufferArena`: header + side table + code chunks in a `bumpalo` arena
//! - `ImageReservation`: `PROT_NONE` reservation at the image base address

pub mod arena;
pub mod error;
pub mod isa;
pub mod options;
pub mod reservation;
pub mod test_utils;

pub use arena::{ChunkHandle, CodeBufferArena, CodeChunk, MethodHeader, METHOD_HEADER_SIZE};
pub use error::{ErrorKind, HarnessError, HarnessResult};
pub use isa::{
    InstructionSet, InstructionSetFeatures, InstructionSetProfile, InstructionSetSelector,
    RUNTIME_ISA,
};
pub use options::{
    BackendKind, CompilerConfigBuilder, CompilerConfiguration, CompilerFilter, ProfileData,
    VerificationResults,
};
pub use reservation::{
    is_reservation_active, ImageReservation, DEFAULT_IMAGE_RESERVATION_SIZE, IMAGE_BASE_ADDRESS,
};
