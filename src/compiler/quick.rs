//! Template backend: every bytecode instruction maps to a fixed native sequence.

use super::{lower, CompiledMethod, VerifiedMethod};
use crate::core::error::HarnessResult;
use crate::core::isa::InstructionSetProfile;
use crate::runtime::{Insn, MethodDef};

#[derive(Debug, Clone, Copy, Default)]
pub struct QuickCompiler;

impl QuickCompiler {
    pub fn compile(
        &self,
        method: &MethodDef,
        code: &[Insn],
        verified: &VerifiedMethod,
        profile: &InstructionSetProfile,
    ) -> HarnessResult<CompiledMethod> {
        let insns: Vec<(u32, Insn)> = code
            .iter()
            .enumerate()
            .map(|(pc, insn)| (pc as u32, insn.clone()))
            .collect();
        lower(method, &insns, verified, profile, false)
    }
}
