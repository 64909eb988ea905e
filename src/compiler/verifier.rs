//! Structural verification of method bytecode.
//!
//! Bodies are straight-line: the verifier tracks the operand stack depth,
//! checks argument indices against the method's arity and requires exactly
//! one return, as the last instruction, matching the declared return type.

use crate::runtime::{parameter_count, Insn, MethodDef};

/// Facts established by a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedMethod {
    /// Deepest operand stack reached.
    pub max_stack: u32,
}

pub fn verify_method(method: &MethodDef) -> Result<VerifiedMethod, String> {
    let code = method
        .code()
        .ok_or_else(|| "method has no bytecode".to_string())?;
    let last = code.len().checked_sub(1).ok_or_else(|| "empty method body".to_string())?;
    let arguments = method.argument_count();

    let mut depth: u32 = 0;
    let mut max_stack: u32 = 0;
    for (pc, insn) in code.iter().enumerate() {
        let (pops, pushes) = match insn {
            Insn::Const(_) => (0, 1),
            Insn::LoadArg(index) => {
                if usize::from(*index) >= arguments {
                    return Err(format!(
                        "pc {pc}: argument {index} out of range for {arguments} arguments"
                    ));
                }
                (0, 1)
            }
            Insn::Add | Insn::Sub | Insn::Mul => (2, 1),
            Insn::Neg => (1, 1),
            Insn::Invoke { signature, .. } => {
                let pushes = u32::from(!signature.ends_with(")V"));
                (parameter_count(signature) as u32, pushes)
            }
            Insn::Return | Insn::ReturnVoid => {
                if pc != last {
                    return Err(format!("pc {pc}: return before the end of the method"));
                }
                let expected = match insn {
                    Insn::Return if method.returns_void() => {
                        return Err(format!("pc {pc}: value return from a void method"))
                    }
                    Insn::ReturnVoid if !method.returns_void() => {
                        return Err(format!("pc {pc}: void return from a non-void method"))
                    }
                    Insn::Return => 1,
                    _ => 0,
                };
                if depth != expected {
                    return Err(format!(
                        "pc {pc}: {depth} values on the stack at return, expected {expected}"
                    ));
                }
                (expected, 0)
            }
        };

        depth = depth
            .checked_sub(pops)
            .ok_or_else(|| format!("pc {pc}: stack underflow"))?;
        depth += pushes;
        max_stack = max_stack.max(depth);
    }

    match code[last] {
        Insn::Return | Insn::ReturnVoid => Ok(VerifiedMethod { max_stack }),
        _ => Err(format!("pc {last}: method does not end with a return")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AccessFlags, ClassBuilder, ClassLoader, Runtime};
    use std::sync::Arc;

    fn method(signature: &str, flags: AccessFlags, code: Vec<Insn>) -> Arc<MethodDef> {
        let runtime = Runtime::new();
        runtime
            .define_class(
                ClassLoader::BOOT,
                ClassBuilder::new("demo.V").method("m", signature, flags, code),
            )
            .unwrap();
        runtime
            .resolution_context()
            .find_class(ClassLoader::BOOT, "demo.V")
            .unwrap()
            .methods()[0]
            .clone()
    }

    #[test]
    fn test_accepts_well_formed() {
        let m = method(
            "(JJ)J",
            AccessFlags::STATIC,
            vec![Insn::LoadArg(0), Insn::LoadArg(1), Insn::Add, Insn::Const(3), Insn::Mul, Insn::Return],
        );
        assert_eq!(verify_method(&m), Ok(VerifiedMethod { max_stack: 2 }));
    }

    #[test]
    fn test_instance_methods_see_receiver() {
        let m = method("(J)J", AccessFlags::PUBLIC, vec![Insn::LoadArg(1), Insn::Return]);
        assert!(verify_method(&m).is_ok());
        let m = method("(J)J", AccessFlags::PUBLIC, vec![Insn::LoadArg(2), Insn::Return]);
        assert!(verify_method(&m).unwrap_err().contains("out of range"));
    }

    #[test]
    fn test_rejects_underflow() {
        let m = method("()J", AccessFlags::STATIC, vec![Insn::Const(1), Insn::Add, Insn::Return]);
        assert!(verify_method(&m).unwrap_err().contains("underflow"));
    }

    #[test]
    fn test_rejects_bad_returns() {
        let m = method("()V", AccessFlags::STATIC, vec![Insn::Const(1), Insn::Return]);
        assert!(verify_method(&m).is_err());

        let m = method("()J", AccessFlags::STATIC, vec![Insn::Const(1), Insn::Const(2), Insn::Return]);
        assert!(verify_method(&m).unwrap_err().contains("expected 1"));

        let m = method("()J", AccessFlags::STATIC, vec![Insn::Const(1)]);
        assert!(verify_method(&m).unwrap_err().contains("does not end"));

        let m = method("()V", AccessFlags::STATIC, vec![Insn::ReturnVoid, Insn::ReturnVoid]);
        assert!(verify_method(&m).is_err());

        let m = method("()V", AccessFlags::STATIC, vec![]);
        assert!(verify_method(&m).is_err());
    }
}
