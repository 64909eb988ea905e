//! Hand-encoded AArch64 instructions and the method templates built on them.

use crate::compiler::{AssembledCode, BinaryOp, EncodingError, MethodAssembler, PcMapping};

const X0: u8 = 0;
const LHS: u8 = 9;
const RHS: u8 = 10;
const SP: u8 = 31;
const XZR: u8 = 31;
const ARGUMENT_REGISTER_COUNT: u8 = 8;

const RET: u32 = 0xD65F03C0;

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn emit_mov_imm64(code: &mut Vec<u8>, dst: u8, value: u64) {
    let parts = [
        (value & 0xFFFF) as u16,
        ((value >> 16) & 0xFFFF) as u16,
        ((value >> 32) & 0xFFFF) as u16,
        ((value >> 48) & 0xFFFF) as u16,
    ];

    let Some(first) = parts.iter().position(|part| *part != 0) else {
        // movz xd, #0
        emit_u32(code, 0xD2800000_u32 | (dst as u32));
        return;
    };

    // movz xd, #part, lsl #(16 * first)
    emit_u32(
        code,
        0xD2800000_u32 | ((first as u32) << 21) | ((parts[first] as u32) << 5) | (dst as u32),
    );
    for (i, part) in parts.iter().enumerate().skip(first + 1) {
        if *part == 0 {
            continue;
        }
        // movk xd, #part, lsl #(16 * i)
        emit_u32(
            code,
            0xF2800000_u32 | ((i as u32) << 21) | ((*part as u32) << 5) | (dst as u32),
        );
    }
}

fn emit_arith_reg(code: &mut Vec<u8>, op: BinaryOp, dst: u8, lhs: u8, rhs: u8) {
    let base = match op {
        BinaryOp::Add => 0x8B000000_u32,
        BinaryOp::Sub => 0xCB000000_u32,
        // madd xd, xn, xm, xzr
        BinaryOp::Mul => 0x9B007C00_u32,
    };
    emit_u32(code, base | ((rhs as u32) << 16) | ((lhs as u32) << 5) | (dst as u32));
}

/// neg xd, xm (sub xd, xzr, xm)
fn emit_neg(code: &mut Vec<u8>, dst: u8, src: u8) {
    emit_u32(
        code,
        0xCB000000_u32 | ((src as u32) << 16) | ((XZR as u32) << 5) | (dst as u32),
    );
}

/// str xt, [sp, #-16]!
fn emit_push(code: &mut Vec<u8>, reg: u8) {
    emit_u32(code, 0xF81F0C00_u32 | ((SP as u32) << 5) | (reg as u32));
}

/// ldr xt, [sp], #16
fn emit_pop(code: &mut Vec<u8>, reg: u8) {
    emit_u32(code, 0xF8410400_u32 | ((SP as u32) << 5) | (reg as u32));
}

/// AArch64 implementation of [`MethodAssembler`].
#[derive(Debug, Default)]
pub struct Arm64MethodAssembler {
    code: Vec<u8>,
    pc_map: Vec<PcMapping>,
}

impl Arm64MethodAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

impl MethodAssembler for Arm64MethodAssembler {
    fn stack_slot_size(&self) -> u32 {
        16
    }

    fn mark_bytecode_pc(&mut self, pc: u32) {
        self.pc_map.push(PcMapping {
            native_pc: self.code.len() as u32,
            bytecode_pc: pc,
        });
    }

    fn push_constant(&mut self, value: i64) -> Result<(), EncodingError> {
        emit_mov_imm64(&mut self.code, LHS, value as u64);
        emit_push(&mut self.code, LHS);
        Ok(())
    }

    fn push_argument(&mut self, index: u8) -> Result<(), EncodingError> {
        if index >= ARGUMENT_REGISTER_COUNT {
            return Err(EncodingError::ArgumentOutOfRange(index));
        }
        emit_push(&mut self.code, index);
        Ok(())
    }

    fn binary_op(&mut self, op: BinaryOp) -> Result<(), EncodingError> {
        emit_pop(&mut self.code, RHS);
        emit_pop(&mut self.code, LHS);
        emit_arith_reg(&mut self.code, op, LHS, LHS, RHS);
        emit_push(&mut self.code, LHS);
        Ok(())
    }

    fn negate(&mut self) -> Result<(), EncodingError> {
        emit_pop(&mut self.code, LHS);
        emit_neg(&mut self.code, LHS, LHS);
        emit_push(&mut self.code, LHS);
        Ok(())
    }

    fn return_top(&mut self) -> Result<(), EncodingError> {
        emit_pop(&mut self.code, X0);
        emit_u32(&mut self.code, RET);
        Ok(())
    }

    fn return_constant(&mut self, value: i64) -> Result<(), EncodingError> {
        emit_mov_imm64(&mut self.code, X0, value as u64);
        emit_u32(&mut self.code, RET);
        Ok(())
    }

    fn return_void(&mut self) -> Result<(), EncodingError> {
        emit_u32(&mut self.code, RET);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<AssembledCode, EncodingError> {
        log::trace!("Assembled {} AArch64 instructions", self.code.len() / 4);
        Ok(AssembledCode {
            code: self.code,
            pc_map: self.pc_map,
        })
    }
}
