// This module is the ARM64/AArch64 code generator. It follows AAPCS64: integer arguments arrive
// in X0-X7 and the result is returned in X0. Instructions are hand encoded as little-endian
// 32-bit words, with X9 and X10 as scratch registers so argument registers are never clobbered.
// Each operand stack slot is 16 bytes so SP stays 16-byte aligned at every push and pop. The
// layout mirrors x64/ with the method templates living in the encoder submodule.

//! ARM64/AArch64 method templates (AAPCS64).

pub mod encoder;

pub use encoder::Arm64MethodAssembler;
