// This module is the compiler side of the harness: the backend strategies, the method verifier,
// the side table format, and the driver that orchestrates them. Backend selection is a tagged
// enum (CompilerBackend) with one strategy struct per BackendKind, dispatched with a match. Both
// strategies lower the stack bytecode to native code through the MethodAssembler trait, which is
// implemented once per instruction set (x64 and arm64 modules); the trait speaks in terms of
// stack-machine operations so a backend never touches encodings directly. Each compiled method
// carries its code and a CodeInfo side table (frame size plus native-pc to bytecode-pc pairs).
// Generated code contains no absolute addresses, so output is identical wherever it ends up and
// however many worker threads produced it.

//! Compiler backends, verification and the compiler driver.

pub mod driver;
pub mod optimizing;
pub mod quick;
pub mod verifier;

pub use driver::{CompilerDriver, DriverStats};
pub use verifier::{verify_method, VerifiedMethod};

use crate::core::error::{HarnessError, HarnessResult};
use crate::core::isa::{InstructionSet, InstructionSetProfile};
use crate::core::options::BackendKind;
use crate::runtime::{Insn, MethodDef};
use optimizing::OptimizingCompiler;
use quick::QuickCompiler;
use thiserror::Error;

/// Failures inside an instruction set's method assembler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("argument {0} is not passed in a register")]
    ArgumentOutOfRange(u8),

    #[error("assembler error: {0}")]
    Assembler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

/// Native code plus the native-pc/bytecode-pc pairs recorded while emitting it.
#[derive(Debug, Clone, Default)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    pub pc_map: Vec<PcMapping>,
}

/// Stack-machine level code emission for one instruction set.
///
/// Every value lives on the native stack; operations pop their operands and
/// push their result.
pub trait MethodAssembler {
    /// Bytes of native stack used per value.
    fn stack_slot_size(&self) -> u32;
    /// Note that code for bytecode `pc` starts at the current position.
    fn mark_bytecode_pc(&mut self, pc: u32);
    fn push_constant(&mut self, value: i64) -> Result<(), EncodingError>;
    fn push_argument(&mut self, index: u8) -> Result<(), EncodingError>;
    fn binary_op(&mut self, op: BinaryOp) -> Result<(), EncodingError>;
    fn negate(&mut self) -> Result<(), EncodingError>;
    /// Pop the top value into the return register and return.
    fn return_top(&mut self) -> Result<(), EncodingError>;
    fn return_constant(&mut self, value: i64) -> Result<(), EncodingError>;
    fn return_void(&mut self) -> Result<(), EncodingError>;
    fn finish(self: Box<Self>) -> Result<AssembledCode, EncodingError>;
}

/// Assembler for `isa`, or `None` when no code generator exists for it.
pub fn new_assembler(
    isa: InstructionSet,
) -> Result<Option<Box<dyn MethodAssembler>>, EncodingError> {
    let asm: Box<dyn MethodAssembler> = match isa {
        InstructionSet::X86_64 => Box::new(crate::x64::X64MethodAssembler::new()?),
        InstructionSet::Arm64 => Box::new(crate::arm64::Arm64MethodAssembler::new()),
        _ => return Ok(None),
    };
    Ok(Some(asm))
}

/// One entry of the native-pc to bytecode-pc table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcMapping {
    pub native_pc: u32,
    pub bytecode_pc: u32,
}

/// Side table stored in front of each compiled method.
///
/// Encoded little-endian as `frame_size_in_bytes`, entry count, then the
/// `(native_pc, bytecode_pc)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeInfo {
    pub frame_size_in_bytes: u32,
    pub pc_map: Vec<PcMapping>,
}

impl CodeInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.pc_map.len() * 8);
        bytes.extend_from_slice(&self.frame_size_in_bytes.to_le_bytes());
        bytes.extend_from_slice(&(self.pc_map.len() as u32).to_le_bytes());
        for entry in &self.pc_map {
            bytes.extend_from_slice(&entry.native_pc.to_le_bytes());
            bytes.extend_from_slice(&entry.bytecode_pc.to_le_bytes());
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut words = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        let frame_size_in_bytes = words.next()?;
        let count = words.next()? as usize;
        let mut pc_map = Vec::with_capacity(count);
        for _ in 0..count {
            pc_map.push(PcMapping {
                native_pc: words.next()?,
                bytecode_pc: words.next()?,
            });
        }
        Some(Self {
            frame_size_in_bytes,
            pc_map,
        })
    }

    /// Bytecode pc of the instruction covering `native_pc`.
    pub fn bytecode_pc_for(&self, native_pc: u32) -> Option<u32> {
        self.pc_map
            .iter()
            .take_while(|entry| entry.native_pc <= native_pc)
            .last()
            .map(|entry| entry.bytecode_pc)
    }
}

/// Output of a backend for one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub instruction_set: InstructionSet,
    pub code: Vec<u8>,
    pub code_info: CodeInfo,
}

impl CompiledMethod {
    pub fn side_table(&self) -> Vec<u8> {
        self.code_info.encode()
    }
}

/// Backend instance, one strategy per [`BackendKind`].
#[derive(Debug)]
pub enum CompilerBackend {
    Quick(QuickCompiler),
    Optimizing(OptimizingCompiler),
}

impl CompilerBackend {
    pub fn new(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Quick => CompilerBackend::Quick(QuickCompiler),
            BackendKind::Optimizing => CompilerBackend::Optimizing(OptimizingCompiler),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            CompilerBackend::Quick(_) => BackendKind::Quick,
            CompilerBackend::Optimizing(_) => BackendKind::Optimizing,
        }
    }

    pub fn supports(&self, isa: InstructionSet) -> bool {
        matches!(isa, InstructionSet::X86_64 | InstructionSet::Arm64)
    }

    pub fn compile(
        &self,
        method: &MethodDef,
        verified: &VerifiedMethod,
        profile: &InstructionSetProfile,
    ) -> HarnessResult<CompiledMethod> {
        let code = method.code().ok_or_else(|| {
            HarnessError::compilation(method.to_string(), "method has no bytecode")
        })?;
        match self {
            CompilerBackend::Quick(compiler) => compiler.compile(method, code, verified, profile),
            CompilerBackend::Optimizing(compiler) => {
                compiler.compile(method, code, verified, profile)
            }
        }
    }
}

/// Lower `(bytecode_pc, insn)` pairs with the assembler for `profile`.
///
/// `fold_returns` turns a constant immediately followed by a return into a
/// single constant return.
pub(crate) fn lower(
    method: &MethodDef,
    insns: &[(u32, Insn)],
    verified: &VerifiedMethod,
    profile: &InstructionSetProfile,
    fold_returns: bool,
) -> HarnessResult<CompiledMethod> {
    let isa = profile.instruction_set;
    let fail = |reason: String| HarnessError::compilation(method.to_string(), reason);
    let mut asm = new_assembler(isa)
        .map_err(|e| fail(e.to_string()))?
        .ok_or_else(|| fail(format!("no code generator for {isa}")))?;

    let mut index = 0;
    while index < insns.len() {
        let (pc, insn) = &insns[index];
        asm.mark_bytecode_pc(*pc);
        let result = match insn {
            Insn::Const(value) => match insns.get(index + 1) {
                Some((_, Insn::Return)) if fold_returns => {
                    index += 1;
                    asm.return_constant(*value)
                }
                _ => asm.push_constant(*value),
            },
            Insn::LoadArg(arg) => asm.push_argument(*arg),
            Insn::Add => asm.binary_op(BinaryOp::Add),
            Insn::Sub => asm.binary_op(BinaryOp::Sub),
            Insn::Mul => asm.binary_op(BinaryOp::Mul),
            Insn::Neg => asm.negate(),
            Insn::Return => asm.return_top(),
            Insn::ReturnVoid => asm.return_void(),
            Insn::Invoke {
                class,
                name,
                signature,
            } => {
                return Err(fail(format!(
                    "invoke of {class}.{name}{signature} at pc {pc} is not supported"
                )))
            }
        };
        result.map_err(|e| fail(format!("pc {pc}: {e}")))?;
        index += 1;
    }

    let frame_size_in_bytes = verified.max_stack * asm.stack_slot_size();
    let assembled = asm.finish().map_err(|e| fail(e.to_string()))?;
    Ok(CompiledMethod {
        instruction_set: isa,
        code: assembled.code,
        code_info: CodeInfo {
            frame_size_in_bytes,
            pc_map: assembled.pc_map,
        },
    })
}
