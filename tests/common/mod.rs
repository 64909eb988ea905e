//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use aot_harness::{AccessFlags, ClassBuilder, ClassLoader, Insn, Runtime};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

static RESERVATION_LOCK: Mutex<()> = Mutex::new(());

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serializes tests that reserve the image range.
pub fn reservation_lock() -> MutexGuard<'static, ()> {
    RESERVATION_LOCK.lock()
}

/// `demo.Calc` with arithmetic methods, and `demo.Shape` / `demo.Square`
/// where the subclass lives in a child loader and overrides `sides()J`.
pub fn calc_runtime() -> (Arc<Runtime>, ClassLoader, ClassLoader) {
    let runtime = Arc::new(Runtime::new());
    let parent = runtime.create_class_loader(None).unwrap();
    let child = runtime.create_class_loader(Some(parent)).unwrap();

    let calc = ClassBuilder::new("demo.Calc")
        .method(
            "fortyTwo",
            "()J",
            AccessFlags::STATIC,
            vec![Insn::Const(6), Insn::Const(7), Insn::Mul, Insn::Return],
        )
        .method(
            "sub",
            "(JJ)J",
            AccessFlags::STATIC,
            vec![Insn::LoadArg(0), Insn::LoadArg(1), Insn::Sub, Insn::Return],
        )
        .method(
            "poly",
            "(JJJJ)J",
            AccessFlags::STATIC | AccessFlags::PRIVATE,
            vec![
                // a * b + c - d, then negated
                Insn::LoadArg(0),
                Insn::LoadArg(1),
                Insn::Mul,
                Insn::LoadArg(2),
                Insn::Add,
                Insn::LoadArg(3),
                Insn::Sub,
                Insn::Neg,
                Insn::Return,
            ],
        )
        .method(
            "big",
            "()J",
            AccessFlags::STATIC,
            vec![Insn::Const(0x1234_5678_9abc), Insn::Const(1), Insn::Add, Insn::Return],
        )
        .method("noop", "()V", AccessFlags::STATIC, vec![Insn::ReturnVoid])
        .bodyless_method("nativeTime", "()J", AccessFlags::STATIC | AccessFlags::NATIVE);
    runtime.define_class(parent, calc).unwrap();

    let shape = ClassBuilder::new("demo.Shape")
        .method(
            "sides",
            "()J",
            AccessFlags::PUBLIC,
            vec![Insn::Const(0), Insn::Return],
        )
        .method(
            "twice",
            "(J)J",
            AccessFlags::PUBLIC,
            vec![Insn::LoadArg(1), Insn::Const(2), Insn::Mul, Insn::Return],
        );
    runtime.define_class(parent, shape).unwrap();

    let square = ClassBuilder::new("demo.Square").extends("demo.Shape").method(
        "sides",
        "()J",
        AccessFlags::PUBLIC,
        vec![Insn::Const(4), Insn::Return],
    );
    runtime.define_class(child, square).unwrap();

    (runtime, parent, child)
}
