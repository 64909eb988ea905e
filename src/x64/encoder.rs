// This module emits x86-64 machine code for the stack bytecode using the iced-x86 CodeAssembler.
// X64MethodAssembler implements the MethodAssembler templates with the native stack as the
// operand stack: constants and arguments are pushed, binary operations pop r11 (rhs) and rax
// (lhs), combine them in rax and push the result, and returns pop into rax before ret. Arguments
// arrive in the System V integer registers rdi, rsi, rdx, rcx, r8 and r9 and stay there for the
// whole method, since the templates only write rax and r11. The frame needs no base pointer
// because the verifier guarantees the stack is balanced at the return. Bytecode pc marks are
// recorded as instruction indices and turned into byte offsets when the block is assembled,
// using iced's RETURN_NEW_INSTRUCTION_OFFSETS option. Code is assembled at ip 0 and contains no absolute
// addresses, so it can be copied anywhere.

//! x86-64 method templates using iced-x86.

use crate::compiler::{AssembledCode, BinaryOp, EncodingError, MethodAssembler, PcMapping};
use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;

/// System V integer argument registers, in order.
const ARGUMENT_REGISTERS: [AsmRegister64; 6] = [rdi, rsi, rdx, rcx, r8, r9];

fn asm_error(e: IcedError) -> EncodingError {
    EncodingError::Assembler(e.to_string())
}

/// x86-64 implementation of [`MethodAssembler`].
pub struct X64MethodAssembler {
    assembler: CodeAssembler,
    /// `(bytecode_pc, instruction index)` pairs.
    marks: Vec<(u32, usize)>,
}

impl X64MethodAssembler {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_error)?;
        Ok(Self {
            assembler,
            marks: Vec::new(),
        })
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }
}

impl MethodAssembler for X64MethodAssembler {
    fn stack_slot_size(&self) -> u32 {
        8
    }

    fn mark_bytecode_pc(&mut self, pc: u32) {
        let index = self.instruction_count();
        self.marks.push((pc, index));
    }

    fn push_constant(&mut self, value: i64) -> Result<(), EncodingError> {
        // push imm32 is sign-extended to 64 bits.
        if let Ok(imm) = i32::try_from(value) {
            return self.assembler.push(imm).map_err(asm_error);
        }
        self.assembler.mov(rax, value).map_err(asm_error)?;
        self.assembler.push(rax).map_err(asm_error)
    }

    fn push_argument(&mut self, index: u8) -> Result<(), EncodingError> {
        let reg = ARGUMENT_REGISTERS
            .get(usize::from(index))
            .copied()
            .ok_or(EncodingError::ArgumentOutOfRange(index))?;
        self.assembler.push(reg).map_err(asm_error)
    }

    fn binary_op(&mut self, op: BinaryOp) -> Result<(), EncodingError> {
        self.assembler.pop(r11).map_err(asm_error)?;
        self.assembler.pop(rax).map_err(asm_error)?;
        match op {
            BinaryOp::Add => self.assembler.add(rax, r11),
            BinaryOp::Sub => self.assembler.sub(rax, r11),
            BinaryOp::Mul => self.assembler.imul_2(rax, r11),
        }
        .map_err(asm_error)?;
        self.assembler.push(rax).map_err(asm_error)
    }

    fn negate(&mut self) -> Result<(), EncodingError> {
        self.assembler.neg(qword_ptr(rsp)).map_err(asm_error)
    }

    fn return_top(&mut self) -> Result<(), EncodingError> {
        self.assembler.pop(rax).map_err(asm_error)?;
        self.assembler.ret().map_err(asm_error)
    }

    fn return_constant(&mut self, value: i64) -> Result<(), EncodingError> {
        self.assembler.mov(rax, value).map_err(asm_error)?;
        self.assembler.ret().map_err(asm_error)
    }

    fn return_void(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_error)
    }

    fn finish(mut self: Box<Self>) -> Result<AssembledCode, EncodingError> {
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_error)?;
        let code = result.inner.code_buffer;
        let offsets = result.inner.new_instruction_offsets;

        let pc_map = self
            .marks
            .iter()
            .map(|&(bytecode_pc, index)| PcMapping {
                native_pc: offsets.get(index).copied().unwrap_or(code.len() as u32),
                bytecode_pc,
            })
            .collect();

        log::trace!(
            "Assembled {} x86-64 instructions into {} bytes",
            offsets.len(),
            code.len()
        );
        Ok(AssembledCode { code, pc_map })
    }
}
