//! AOT compiler harness.
//!
//! Drives an ahead-of-time compiler backend over one class or method at a
//! time so the generated native code can be inspected or called directly
//! from a test, without building a whole program image.
//!
//! # Primary Usage
//!
//! ```ignore
//! use aot_harness::{CompilerHarness, HarnessOptions, Runtime};
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(Runtime::new());
//! // ... define classes ...
//! let mut harness = CompilerHarness::set_up(runtime, HarnessOptions::from_env()?)?;
//! harness.compile_direct_method(loader, "demo.Arith", "answer", "()J")?;
//! let entry = harness.make_executable(loader, "demo.Arith", "answer", "()J")?;
//! let answer: extern "C" fn() -> i64 = unsafe { std::mem::transmute(entry.address().unwrap()) };
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Error type, instruction sets, configuration, code arena, image reservation
//! - [`runtime`] - Managed object model and the resolution context
//! - [`compiler`] - Verifier, backends and the compiler driver
//! - [`x64`] / [`arm64`] - Per-instruction-set method assemblers
//! - [`materialize`] - Executable mappings and entry points
//! - [`harness`] - Set-up / tear-down lifecycle and environment configuration

pub mod arm64;
pub mod compiler;
pub mod core;
pub mod harness;
pub mod materialize;
pub mod runtime;
pub mod x64;

pub use crate::core::{
    // Errors
    ErrorKind, HarnessError, HarnessResult,
    // Instruction sets
    InstructionSet, InstructionSetFeatures, InstructionSetProfile, InstructionSetSelector,
    // Configuration
    BackendKind, CompilerConfigBuilder, CompilerConfiguration, CompilerFilter, ProfileData,
    VerificationResults,
    // Code storage
    ChunkHandle, CodeBufferArena, CodeChunk, ImageReservation,
};
pub use compiler::{CompilerDriver, DriverStats};
pub use harness::{CompilerHarness, HarnessOptions};
pub use materialize::{create_oat_method, make_executable, EntryPoint, ExecutableBlock, OatMethod};
pub use runtime::{
    AccessFlags, ClassBuilder, ClassDef, ClassLoader, Insn, MethodDef, MethodId,
    ResolutionContext, Runtime,
};
