// The optimizing backend folds constant expressions before lowering. It simulates the operand
// stack over the bytecode: whenever an arithmetic instruction finds constant operands on top of
// the folded stream, the operands are replaced by their (wrapping) result, so `2 * 3 + 4` becomes
// a single constant. The folded stream keeps the bytecode pc of the first instruction of each
// folded expression so the pc table still points at real bytecode. Lowering then uses the shared
// templates with the constant-return peephole enabled.

//! Constant-folding backend.

use super::{lower, CompiledMethod, VerifiedMethod};
use crate::core::error::HarnessResult;
use crate::core::isa::InstructionSetProfile;
use crate::runtime::{Insn, MethodDef};

#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizingCompiler;

impl OptimizingCompiler {
    pub fn compile(
        &self,
        method: &MethodDef,
        code: &[Insn],
        verified: &VerifiedMethod,
        profile: &InstructionSetProfile,
    ) -> HarnessResult<CompiledMethod> {
        let folded = fold_constants(code);
        log::trace!(
            "Folded {} into {} instructions ({} before)",
            method,
            folded.len(),
            code.len()
        );
        lower(method, &folded, verified, profile, true)
    }
}

/// Fold arithmetic on constant operands, keeping the originating bytecode pcs.
pub fn fold_constants(code: &[Insn]) -> Vec<(u32, Insn)> {
    let mut out: Vec<(u32, Insn)> = Vec::with_capacity(code.len());

    for (pc, insn) in code.iter().enumerate() {
        let pc = pc as u32;
        match insn {
            Insn::Add | Insn::Sub | Insn::Mul => {
                let len = out.len();
                if let [.., (lhs_pc, Insn::Const(lhs)), (_, Insn::Const(rhs))] = out.as_slice() {
                    let value = match insn {
                        Insn::Add => lhs.wrapping_add(*rhs),
                        Insn::Sub => lhs.wrapping_sub(*rhs),
                        _ => lhs.wrapping_mul(*rhs),
                    };
                    let lhs_pc = *lhs_pc;
                    out.truncate(len - 2);
                    out.push((lhs_pc, Insn::Const(value)));
                    continue;
                }
            }
            Insn::Neg => {
                if let Some((_, Insn::Const(value))) = out.last_mut() {
                    *value = value.wrapping_neg();
                    continue;
                }
            }
            _ => {}
        }
        out.push((pc, insn.clone()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_nested_expressions() {
        let code = vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Mul,
            Insn::Const(4),
            Insn::Add,
            Insn::Neg,
            Insn::Return,
        ];
        assert_eq!(
            fold_constants(&code),
            vec![(0, Insn::Const(-10)), (6, Insn::Return)]
        );
    }

    #[test]
    fn test_keeps_non_constant_operands() {
        let code = vec![
            Insn::LoadArg(0),
            Insn::Const(5),
            Insn::Const(6),
            Insn::Add,
            Insn::Sub,
            Insn::Return,
        ];
        assert_eq!(
            fold_constants(&code),
            vec![
                (0, Insn::LoadArg(0)),
                (1, Insn::Const(11)),
                (4, Insn::Sub),
                (5, Insn::Return),
            ]
        );
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let code = vec![Insn::Const(i64::MAX), Insn::Const(1), Insn::Add, Insn::Return];
        assert_eq!(fold_constants(&code)[0], (0, Insn::Const(i64::MIN)));
    }
}
