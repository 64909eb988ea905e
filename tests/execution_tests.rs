//! Compile, materialize and call generated code on the host.

#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

mod common;

use aot_harness::{
    BackendKind, ClassLoader, CompilerHarness, EntryPoint, HarnessOptions, InstructionSet,
    OatMethod,
};
use common::{calc_runtime, init_logging};

#[cfg(target_arch = "x86_64")]
const RETURN_42: &[u8] = &[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3]; // mov rax, 42; ret
#[cfg(target_arch = "aarch64")]
const RETURN_42: &[u8] = &[0x40, 0x05, 0x80, 0xd2, 0xc0, 0x03, 0x5f, 0xd6]; // movz x0, #42; ret

type Fn0 = extern "C" fn() -> i64;
type Fn1 = extern "C" fn(i64) -> i64;
type Fn2 = extern "C" fn(i64, i64) -> i64;
type Fn4 = extern "C" fn(i64, i64, i64, i64) -> i64;

fn host_harness(backend_kind: BackendKind) -> (CompilerHarness, ClassLoader, ClassLoader) {
    init_logging();
    let (runtime, parent, child) = calc_runtime();
    let harness = CompilerHarness::set_up(
        runtime,
        HarnessOptions {
            backend_kind,
            ..HarnessOptions::default()
        },
    )
    .unwrap();
    assert!(matches!(
        harness.instruction_set(),
        InstructionSet::X86_64 | InstructionSet::Arm64
    ));
    (harness, parent, child)
}

fn address(entry: EntryPoint) -> usize {
    entry.address().expect("method was not compiled")
}

#[test]
fn test_raw_code_round_trip() {
    let (mut harness, _, _) = host_harness(BackendKind::Optimizing);
    let code = harness.make_executable_code(RETURN_42).unwrap();
    let f: Fn0 = unsafe { std::mem::transmute(code) };
    assert_eq!(f(), 42);
}

#[test]
fn test_compiled_methods_return_expected_values() {
    for backend_kind in [BackendKind::Quick, BackendKind::Optimizing] {
        let (mut harness, parent, _) = host_harness(backend_kind);
        let compiled = harness.compile_class(parent, "demo.Calc").unwrap();
        assert_eq!(compiled.len(), 5);

        let forty_two: Fn0 = unsafe {
            std::mem::transmute(address(
                harness.make_executable(parent, "demo.Calc", "fortyTwo", "()J").unwrap(),
            ))
        };
        assert_eq!(forty_two(), 42, "{backend_kind}");

        let sub: Fn2 = unsafe {
            std::mem::transmute(address(
                harness.make_executable(parent, "demo.Calc", "sub", "(JJ)J").unwrap(),
            ))
        };
        assert_eq!(sub(50, 8), 42);
        assert_eq!(sub(i64::MIN, 1), i64::MAX);

        let poly: Fn4 = unsafe {
            std::mem::transmute(address(
                harness.make_executable(parent, "demo.Calc", "poly", "(JJJJ)J").unwrap(),
            ))
        };
        assert_eq!(poly(3, 4, 5, 6), -11);
        assert_eq!(poly(-2, 7, 0, 0), 14);

        let big: Fn0 = unsafe {
            std::mem::transmute(address(
                harness.make_executable(parent, "demo.Calc", "big", "()J").unwrap(),
            ))
        };
        assert_eq!(big(), 0x1234_5678_9abd);

        let noop: extern "C" fn() = unsafe {
            std::mem::transmute(address(
                harness.make_executable(parent, "demo.Calc", "noop", "()V").unwrap(),
            ))
        };
        noop();

        let native = harness
            .make_executable(parent, "demo.Calc", "nativeTime", "()J")
            .unwrap();
        assert_eq!(native, EntryPoint::Interpreter);
    }
}

#[test]
fn test_virtual_dispatch_targets() {
    let (mut harness, _, child) = host_harness(BackendKind::Optimizing);
    harness
        .compile_virtual_method(child, "demo.Square", "sides", "()J")
        .unwrap();
    harness
        .compile_virtual_method(child, "demo.Square", "twice", "(J)J")
        .unwrap();

    let sides: Fn0 = unsafe {
        std::mem::transmute(address(
            harness.make_executable(child, "demo.Square", "sides", "()J").unwrap(),
        ))
    };
    assert_eq!(sides(), 4);

    // Argument 0 is the receiver; the body only reads argument 1.
    let twice: Fn2 = unsafe {
        std::mem::transmute(address(
            harness.make_executable(child, "demo.Square", "twice", "(J)J").unwrap(),
        ))
    };
    assert_eq!(twice(0, 21), 42);
}

#[test]
fn test_oat_method_links_entry_point() {
    let (mut harness, parent, _) = host_harness(BackendKind::Quick);
    let code = harness.make_executable_code(RETURN_42).unwrap();

    let oat: OatMethod = harness.create_oat_method(code as *const u8).unwrap();
    assert_eq!(oat.code_pointer(), code);
    assert_eq!(oat.begin() + std::mem::size_of::<usize>(), code);

    let method = harness
        .runtime()
        .resolution_context()
        .resolve_direct_method(parent, "demo.Calc", "fortyTwo", "()J")
        .unwrap();
    oat.link_method(&method, harness.instruction_set());
    assert_eq!(method.entry_point(), EntryPoint::Compiled(code));

    let f: Fn0 = unsafe { std::mem::transmute(address(method.entry_point())) };
    assert_eq!(f(), 42);
}

#[test]
fn test_blocks_survive_arena_growth() {
    let (mut harness, parent, _) = host_harness(BackendKind::Optimizing);
    harness
        .compile_direct_method(parent, "demo.Calc", "fortyTwo", "()J")
        .unwrap();
    let entry = harness
        .make_executable(parent, "demo.Calc", "fortyTwo", "()J")
        .unwrap();

    // Recompiling appends new chunks; the materialized copy is unaffected.
    for _ in 0..32 {
        harness.compile_class(parent, "demo.Calc").unwrap();
    }
    let f: Fn0 = unsafe { std::mem::transmute(address(entry)) };
    assert_eq!(f(), 42);

    let ignores_argument: Fn1 =
        unsafe { std::mem::transmute(harness.make_executable_code(RETURN_42).unwrap()) };
    assert_eq!(ignores_argument(7), 42);
}
