//! x86-64 architecture-specific components.
//!
//! - [`encoder`]: System V method templates assembled with iced-x86
//! - [`disassemble`]: Intel-syntax listing of generated code

pub mod encoder;

pub use encoder::X64MethodAssembler;

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

/// Decode `code` as 64-bit x86 starting at `ip`, one string per instruction.
pub fn disassemble(code: &[u8], ip: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut lines = Vec::new();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let mut line = String::new();
        formatter.format(&instruction, &mut line);
        lines.push(line);
    }
    lines
}
