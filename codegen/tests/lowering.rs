//! Shapes of the canonical move lowering.

use mass_codegen::abi::CALLING_CONVENTION_X86_64_SYSTEM_V;
use mass_codegen::builder::FunctionBuilder;
use mass_codegen::descriptor;
use mass_codegen::encoding::Mnemonic;
use mass_codegen::instruction::InstructionKind;
use mass_codegen::mnemonics;
use mass_codegen::{
    Bits, Compilation, CompareType, FunctionInfo, Program, Register, SourceRange, Storage,
};

fn assembly_mnemonics<'c>(builder: &FunctionBuilder<'c>) -> Vec<&'static str> {
    builder
        .code_block
        .instructions
        .iter()
        .filter_map(|instruction| match instruction.kind {
            InstructionKind::Assembly { mnemonic, .. } => Some(mnemonic.name),
            _ => None,
        })
        .collect()
}

fn count_kind<'c>(
    builder: &FunctionBuilder<'c>,
    predicate: impl Fn(&InstructionKind<'c>) -> bool,
) -> usize {
    builder
        .code_block
        .instructions
        .iter()
        .filter(|instruction| predicate(&instruction.kind))
        .count()
}

fn fixture<'c>(
    compilation: &'c Compilation,
    info: &'c FunctionInfo<'c>,
) -> (Program<'c>, FunctionBuilder<'c>) {
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
        .call_setup(compilation, info)
        .unwrap();
    let builder = FunctionBuilder::new(&mut program, info, setup);
    (program, builder)
}

#[test]
fn moving_zero_into_a_register_is_one_xor() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let target = Storage::register(Register::A, Bits(64));
    builder
        .move_value(SourceRange::default(), &target, &Storage::immediate_s32(0))
        .unwrap();

    assert_eq!(builder.code_block.instructions.len(), 1);
    let InstructionKind::Assembly { mnemonic, operands } = builder.code_block.instructions[0].kind
    else {
        panic!("expected an assembly instruction");
    };
    assert!(Mnemonic::same(mnemonic, &mnemonics::XOR));
    assert_eq!(operands[0], target);
    assert_eq!(operands[1], target);
    assert!(builder.register_occupied_bitset.is_empty());
}

#[test]
fn small_memory_to_memory_goes_through_one_scratch_register() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let a = builder.reserve_stack(&descriptor::S64);
    let b = builder.reserve_stack(&descriptor::S64);
    builder.move_value(SourceRange::default(), &a, &b).unwrap();

    // Two encoded moves, each with its stack-patch marker; no register
    // remains claimed.
    assert_eq!(
        count_kind(&builder, |kind| matches!(kind, InstructionKind::Bytes(_))),
        2
    );
    assert_eq!(
        count_kind(&builder, |kind| matches!(
            kind,
            InstructionKind::StackPatch { .. }
        )),
        2
    );
    assert!(builder.register_occupied_bitset.is_empty());
    assert!(builder.used_register_bitset.contains(Register::C.bit()));
}

#[test]
fn large_memory_to_memory_uses_rep_movsb_and_restores_string_registers() {
    let compilation = Compilation::new();
    let pair = compilation.descriptor_struct(&[("a", &descriptor::S64), ("b", &descriptor::S64)]);
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let a = builder.reserve_stack(pair);
    let b = builder.reserve_stack(pair);
    builder.move_value(SourceRange::default(), &a, &b).unwrap();

    let names = assembly_mnemonics(&builder);
    assert_eq!(names.iter().filter(|&&name| name == "rep movsb").count(), 1);
    // Three saves and the count load before, three restores after.
    let rep_position = names.iter().position(|&name| name == "rep movsb").unwrap();
    assert_eq!(
        names[..rep_position].iter().filter(|&&name| name == "mov").count(),
        4
    );
    assert_eq!(
        names[rep_position + 1..].iter().filter(|&&name| name == "mov").count(),
        3
    );
    // The two lea instructions carry symbolic stack operands, so they were
    // eagerly encoded.
    assert_eq!(
        count_kind(&builder, |kind| matches!(
            kind,
            InstructionKind::StackPatch { .. }
        )),
        2
    );
    assert!(builder.register_occupied_bitset.is_empty());
    // The string registers themselves never serve as the scratch copies.
    assert!(!builder.used_register_bitset.contains(Register::Si.bit()));
    assert!(!builder.used_register_bitset.contains(Register::Di.bit()));
}

#[test]
fn eflags_materialize_through_setcc() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let target = Storage::register(Register::A, Bits(32));
    let flags = Storage::eflags(CompareType::SignedLess);
    builder
        .move_value(SourceRange::default(), &target, &flags)
        .unwrap();

    assert_eq!(assembly_mnemonics(&builder), ["setl", "movsx", "mov"]);
    assert!(builder.register_occupied_bitset.is_empty());
}

#[test]
fn wide_immediate_stores_detour_through_a_register() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let local = builder.reserve_stack(&descriptor::S64);
    builder
        .move_value(
            SourceRange::default(),
            &local,
            &Storage::immediate_s64(0x0102_0304_0506_0708),
        )
        .unwrap();

    // mov temp, imm64 stays abstract; the store was eagerly encoded.
    assert_eq!(assembly_mnemonics(&builder), ["mov"]);
    assert_eq!(
        count_kind(&builder, |kind| matches!(kind, InstructionKind::Bytes(_))),
        1
    );
    assert!(builder.register_occupied_bitset.is_empty());
}

#[test]
fn widening_from_32_bits_uses_a_32_bit_write() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let target = Storage::register(Register::A, Bits(64));
    let source = Storage::register(Register::C, Bits(32));
    builder
        .move_value(SourceRange::default(), &target, &source)
        .unwrap();

    let InstructionKind::Assembly { mnemonic, operands } = builder.code_block.instructions[0].kind
    else {
        panic!("expected an assembly instruction");
    };
    assert!(Mnemonic::same(mnemonic, &mnemonics::MOV));
    assert_eq!(operands[0], Storage::register(Register::A, Bits(32)));
}

#[test]
fn narrow_widening_uses_movsx() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let target = Storage::register(Register::A, Bits(64));
    let source = Storage::register(Register::C, Bits(8));
    builder
        .move_value(SourceRange::default(), &target, &source)
        .unwrap();
    assert_eq!(assembly_mnemonics(&builder), ["movsx"]);
}

#[test]
fn saving_an_occupied_fixed_register_replays_the_restore() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    builder.register_acquire(Register::D);
    let saved = builder
        .register_acquire_maybe_save_if_already_acquired(Register::D, SourceRange::default())
        .unwrap();
    assert!(saved.saved_index.is_some());
    builder.register_release_maybe_restore(&saved).unwrap();

    // Save and restore moves around the protected region.
    assert_eq!(assembly_mnemonics(&builder), ["mov", "mov"]);
    // The original claim on D is still standing; the scratch is free again.
    assert!(builder.register_occupied(Register::D));
    builder.register_release(Register::D);
    assert!(builder.register_occupied_bitset.is_empty());
}

#[test]
fn load_address_of_a_local() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let (_program, mut builder) = fixture(&compilation, &info);

    let local = builder.reserve_stack(&descriptor::S64);
    let result = Storage::register(Register::A, Bits(64));
    builder
        .load_address(SourceRange::default(), &result, &local)
        .unwrap();

    // lea with a symbolic stack operand encodes eagerly.
    assert_eq!(
        count_kind(&builder, |kind| matches!(kind, InstructionKind::Bytes(_))),
        1
    );
    assert_eq!(
        count_kind(&builder, |kind| matches!(
            kind,
            InstructionKind::StackPatch { .. }
        )),
        1
    );
    assert!(builder.register_occupied_bitset.is_empty());
}
