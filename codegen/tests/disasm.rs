//! Round-trip the encoder's output through a known-good disassembler.
//!
//! Each case encodes one instruction, feeds the bytes to capstone in 64-bit
//! mode and checks the decoded mnemonic (and, where the formatting is
//! stable, the operands).

use capstone::prelude::*;

use mass_codegen::abi::CALLING_CONVENTION_X86_64_SYSTEM_V;
use mass_codegen::encoder::encode_instruction;
use mass_codegen::instruction::Instruction;
use mass_codegen::mnemonics;
use mass_codegen::{
    Bits, CompareType, Program, Register, SourceRange, StackArea, Storage,
};

fn encode_one(mnemonic: &'static mass_codegen::encoding::Mnemonic, operands: [Storage; 3]) -> Vec<u8> {
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let code = program.code_section;
    let mut instruction = Instruction::assembly(mnemonic, operands, SourceRange::default());
    encode_instruction(&mut program, code, &mut instruction).unwrap();
    program.sections[code].buffer.clone()
}

fn disassemble_one(bytes: &[u8]) -> (String, String) {
    let capstone = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .build()
        .expect("capstone");
    let instructions = capstone.disasm_all(bytes, 0x1000).expect("disassembly");
    assert_eq!(
        instructions.len(),
        1,
        "expected a single instruction from {:02x?}",
        bytes
    );
    let instruction = instructions.iter().next().unwrap();
    assert_eq!(
        instruction.bytes().len(),
        bytes.len(),
        "trailing bytes not consumed from {:02x?}",
        bytes
    );
    (
        instruction.mnemonic().unwrap_or("").to_string(),
        instruction.op_str().unwrap_or("").to_string(),
    )
}

fn reg64(register: Register) -> Storage<'static> {
    Storage::register(register, Bits(64))
}

fn stack64(offset: i32) -> Storage<'static> {
    Storage::stack(StackArea::Absolute, offset, Bits(64))
}

const NONE: Storage<'static> = mass_codegen::storage::STORAGE_NONE;

#[test]
fn mov_register_register() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::MOV,
        [reg64(Register::A), reg64(Register::C), NONE],
    ));
    assert_eq!(mnemonic, "mov");
    assert_eq!(operands, "rax, rcx");
}

#[test]
fn mov_register_memory() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::MOV,
        [reg64(Register::A), stack64(8), NONE],
    ));
    assert_eq!(mnemonic, "mov");
    assert!(operands.contains("rax") && operands.contains("rsp"), "{operands}");
}

#[test]
fn mov_extended_registers() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::MOV,
        [reg64(Register::R9), reg64(Register::R8), NONE],
    ));
    assert_eq!(mnemonic, "mov");
    assert_eq!(operands, "r9, r8");
}

#[test]
fn mov_imm64() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::MOV,
        [
            reg64(Register::A),
            Storage::immediate_s64(0x1234_5678_9abc_def0),
            NONE,
        ],
    ));
    assert_eq!(mnemonic, "movabs");
    assert!(operands.starts_with("rax"), "{operands}");
}

#[test]
fn add_and_sub_and_xor() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::ADD,
        [reg64(Register::A), reg64(Register::B), NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("add", "rax, rbx"));

    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::SUB,
        [reg64(Register::Sp), Storage::immediate_s8(24), NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("sub", "rsp, 0x18"));

    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::XOR,
        [reg64(Register::A), reg64(Register::A), NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("xor", "rax, rax"));
}

#[test]
fn imul_and_idiv() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::IMUL,
        [reg64(Register::A), reg64(Register::C), NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("imul", "rax, rcx"));

    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::IDIV,
        [reg64(Register::C), NONE, NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("idiv", "rcx"));
}

#[test]
fn cmp_immediate() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::CMP,
        [reg64(Register::A), Storage::immediate_s32(42), NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("cmp", "rax, 0x2a"));
}

#[test]
fn lea_stack_address() {
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::LEA,
        [reg64(Register::A), stack64(16), NONE],
    ));
    assert_eq!(mnemonic, "lea");
    assert!(operands.contains("rax") && operands.contains("rsp"), "{operands}");
}

#[test]
fn push_and_pop() {
    let (mnemonic, operands) =
        disassemble_one(&encode_one(&mnemonics::PUSH, [reg64(Register::R12), NONE, NONE]));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("push", "r12"));

    let (mnemonic, operands) =
        disassemble_one(&encode_one(&mnemonics::POP, [reg64(Register::R12), NONE, NONE]));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("pop", "r12"));
}

#[test]
fn ret_and_int3_and_syscall() {
    let (mnemonic, _) = disassemble_one(&encode_one(&mnemonics::RET, [NONE, NONE, NONE]));
    assert_eq!(mnemonic, "ret");

    let (mnemonic, _) = disassemble_one(&encode_one(&mnemonics::INT3, [NONE, NONE, NONE]));
    assert_eq!(mnemonic, "int3");

    let (mnemonic, _) = disassemble_one(&encode_one(&mnemonics::SYSCALL, [NONE, NONE, NONE]));
    assert_eq!(mnemonic, "syscall");
}

#[test]
fn sse_moves() {
    let xmm0 = Storage::register(Register::Xmm0, Bits(32));
    let xmm1 = Storage::register(Register::Xmm1, Bits(32));
    let (mnemonic, operands) = disassemble_one(&encode_one(&mnemonics::MOVSS, [xmm0, xmm1, NONE]));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("movss", "xmm0, xmm1"));

    let xmm0 = Storage::register(Register::Xmm0, Bits(64));
    let xmm2 = Storage::register(Register::Xmm2, Bits(64));
    let (mnemonic, operands) = disassemble_one(&encode_one(&mnemonics::MOVSD, [xmm0, xmm2, NONE]));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("movsd", "xmm0, xmm2"));
}

#[test]
fn setcc_and_movsx() {
    let al = Storage::register(Register::A, Bits(8));
    let eflags = Storage::eflags(CompareType::Equal);
    let (mnemonic, operands) = disassemble_one(&encode_one(&mnemonics::SETE, [al, eflags, NONE]));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("sete", "al"));

    let cl = Storage::register(Register::C, Bits(8));
    let (mnemonic, operands) = disassemble_one(&encode_one(
        &mnemonics::MOVSX,
        [reg64(Register::A), cl, NONE],
    ));
    assert_eq!((mnemonic.as_str(), operands.as_str()), ("movsx", "rax, cl"));
}

#[test]
fn jumps_and_calls_through_labels() {
    // A forward jump to a label bound right after the instruction: after
    // patching, the displacement is zero.
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let code = program.code_section;
    let label = program.make_label(code, "target");

    let mut jump = Instruction::assembly(
        &mnemonics::JMP,
        [Storage::code_label32(label), NONE, NONE],
        SourceRange::default(),
    );
    encode_instruction(&mut program, code, &mut jump).unwrap();
    let mut call = Instruction::assembly(
        &mnemonics::CALL,
        [Storage::code_label32(label), NONE, NONE],
        SourceRange::default(),
    );
    encode_instruction(&mut program, code, &mut call).unwrap();
    let mut conditional = Instruction::assembly(
        &mnemonics::JNE,
        [
            Storage::code_label32(label),
            Storage::eflags(CompareType::NotEqual),
            NONE,
        ],
        SourceRange::default(),
    );
    encode_instruction(&mut program, code, &mut conditional).unwrap();

    let offset = program.sections[code].current_offset();
    program.set_label_offset(label, offset);
    program.patch_labels().unwrap();

    let bytes = program.sections[code].buffer.clone();
    let capstone = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .build()
        .unwrap();
    let instructions = capstone.disasm_all(&bytes, 0).unwrap();
    let mnemonics_seen: Vec<String> = instructions
        .iter()
        .map(|instruction| instruction.mnemonic().unwrap_or("").to_string())
        .collect();
    assert_eq!(mnemonics_seen, ["jmp", "call", "jne"]);

    // Every displacement lands on the label: the byte right after the
    // last instruction.
    for instruction in instructions.iter() {
        let operand = instruction.op_str().unwrap_or("");
        assert_eq!(operand, format!("{:#x}", offset), "{}", operand);
    }
}

#[test]
fn rip_relative_memory_access() {
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
    let code = program.code_section;
    let data_label = program.append_data("constant", &42u64.to_le_bytes(), 8);

    let mut load = Instruction::assembly(
        &mnemonics::MOV,
        [
            reg64(Register::A),
            Storage::rip_relative(data_label, Bits(64)),
            NONE,
        ],
        SourceRange::default(),
    );
    encode_instruction(&mut program, code, &mut load).unwrap();

    // Lay the data section right after the code in the address space.
    let code_len = program.sections[code].current_offset();
    program.sections[code].base_rva = 0;
    program.sections[program.data_section].base_rva = code_len;
    program.patch_labels().unwrap();

    let bytes = program.sections[code].buffer.clone();
    // REX.W 8B modrm(00 000 101) disp32
    assert_eq!(&bytes[..3], &[0x48, 0x8B, 0x05]);
    let displacement = i32::from_le_bytes(bytes[3..7].try_into().unwrap());
    assert_eq!(displacement, 0, "data label sits right after the load");

    let (mnemonic, operands) = disassemble_one(&bytes);
    assert_eq!(mnemonic, "mov");
    assert!(operands.contains("rip"), "{operands}");
}
