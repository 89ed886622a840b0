//! Execute freshly compiled functions in-process.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use mass_codegen::abi::{
    CALLING_CONVENTION_X86_64_SYSTEM_V, CALLING_CONVENTION_X86_64_SYSTEM_V_SYSCALL,
};
use mass_codegen::builder::FunctionBuilder;
use mass_codegen::descriptor;
use mass_codegen::mnemonics;
use mass_codegen::storage::STORAGE_NONE;
use mass_codegen::{Bits, Compilation, FunctionInfo, Program, Register, SourceRange, Storage};
use mass_jit::jit_compile;

#[test]
fn returns_a_constant() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::S32);
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
        .call_setup(&compilation, &info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, &info, setup);

    let return_storage = builder.call_setup.callee_return;
    builder
        .move_value(
            SourceRange::default(),
            &return_storage,
            &Storage::immediate_s32(42),
        )
        .unwrap();
    builder.end();
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let jit = jit_compile(&mut program).unwrap();
    let entry = jit.entry_pointer(&program).unwrap();
    let function: extern "sysv64" fn() -> i32 = unsafe { core::mem::transmute(entry) };
    assert_eq!(function(), 42);
}

#[test]
fn locals_survive_the_frame_resolver() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::S32);
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
        .call_setup(&compilation, &info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, &info, setup);

    // A value round-trips through a stack slot.
    let source_range = SourceRange::default();
    let local = builder.reserve_stack(&descriptor::S32);
    builder
        .move_value(source_range, &local, &Storage::immediate_s32(1234))
        .unwrap();
    let return_storage = builder.call_setup.callee_return;
    builder
        .move_value(source_range, &return_storage, &local)
        .unwrap();
    builder.end();
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let jit = jit_compile(&mut program).unwrap();
    let entry = jit.entry_pointer(&program).unwrap();
    let function: extern "sysv64" fn() -> i32 = unsafe { core::mem::transmute(entry) };
    assert_eq!(function(), 1234);
}

#[test]
fn syscall_lowering_reaches_the_kernel() {
    const SYS_GETPID: i64 = 39;

    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::S32);
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let setup = CALLING_CONVENTION_X86_64_SYSTEM_V_SYSCALL
        .call_setup(&compilation, &info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, &info, setup);

    let source_range = SourceRange::default();
    let syscall_number = Storage::register(Register::A, Bits(64));
    builder
        .move_value(
            source_range,
            &syscall_number,
            &Storage::immediate_s64(SYS_GETPID),
        )
        .unwrap();
    builder
        .push_assembly(
            &mnemonics::SYSCALL,
            [STORAGE_NONE, STORAGE_NONE, STORAGE_NONE],
            source_range,
        )
        .unwrap();
    builder.end();
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let jit = jit_compile(&mut program).unwrap();
    let entry = jit.entry_pointer(&program).unwrap();
    let function: extern "sysv64" fn() -> i32 = unsafe { core::mem::transmute(entry) };
    assert_eq!(function(), std::process::id() as i32);
}

#[test]
fn programs_with_imports_are_rejected() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let _ = program.import_symbol("libc.so.6", "write");
    let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
        .call_setup(&compilation, &info)
        .unwrap();
    let builder = FunctionBuilder::new(&mut program, &info, setup);
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let error = jit_compile(&mut program).unwrap_err();
    assert!(matches!(
        error.kind,
        mass_codegen::ErrorKind::DynamicLibraryLoad(_)
    ));
}
