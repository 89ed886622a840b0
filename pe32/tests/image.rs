//! Write a minimal executable and pick its headers apart.

use mass_codegen::abi::CALLING_CONVENTION_X86_64_WINDOWS;
use mass_codegen::builder::FunctionBuilder;
use mass_codegen::descriptor;
use mass_codegen::mnemonics;
use mass_codegen::storage::STORAGE_NONE;
use mass_codegen::{Bits, Compilation, FunctionInfo, Program, Register, SourceRange, Storage};
use mass_pe32::{encode_executable, write_executable, ExecutableType};

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// `main: () -> () { ExitProcess(42) }` with `ExitProcess` imported from
/// kernel32.dll.
fn exit_code_image(compilation: &Compilation, info: &FunctionInfo<'static>) -> Vec<u8> {
    let mut program = Program::new(&CALLING_CONVENTION_X86_64_WINDOWS);
    let exit_process = program.import_symbol("kernel32.dll", "ExitProcess");

    let setup = CALLING_CONVENTION_X86_64_WINDOWS
        .call_setup(compilation, info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, info, setup);

    let source_range = SourceRange::default();
    let argument = Storage::register(Register::C, Bits(32));
    builder
        .move_value(source_range, &argument, &Storage::immediate_s32(42))
        .unwrap();
    builder.note_call_parameters_stack_size(32);
    builder
        .push_assembly(
            &mnemonics::CALL,
            [exit_process, STORAGE_NONE, STORAGE_NONE],
            source_range,
        )
        .unwrap();
    builder.end();

    program.functions.push(builder);
    program.entry_point = Some(info);

    encode_executable(&mut program, ExecutableType::Cli).unwrap()
}

#[test]
fn headers_are_well_formed() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let image = exit_code_image(&compilation, &info);

    // DOS header.
    assert_eq!(&image[0..2], b"MZ");
    let pe_offset = u32_at(&image, 0x3C) as usize;
    assert_eq!(pe_offset, 64);
    assert_eq!(&image[pe_offset..pe_offset + 4], b"PE\0\0");

    // File header.
    let file_header = pe_offset + 4;
    assert_eq!(u16_at(&image, file_header), 0x8664, "machine");
    assert_eq!(u16_at(&image, file_header + 2), 2, "section count");
    assert_eq!(u16_at(&image, file_header + 16), 240, "optional header size");
    assert_eq!(u16_at(&image, file_header + 18), 0x0022, "characteristics");

    // Optional header.
    let optional = file_header + 20;
    assert_eq!(u16_at(&image, optional), 0x20B, "PE32+ magic");
    assert_eq!(u32_at(&image, optional + 32), 0x1000, "section alignment");
    assert_eq!(u32_at(&image, optional + 36), 0x200, "file alignment");
    assert_eq!(u16_at(&image, optional + 40), 6, "major OS version");
    assert_eq!(u16_at(&image, optional + 48), 6, "major subsystem version");
    assert_eq!(u16_at(&image, optional + 68), 3, "CUI subsystem");
    assert_eq!(u16_at(&image, optional + 70), 0x8160, "dll characteristics");

    // Section table: .rdata then .text.
    let sections = optional + 240;
    assert_eq!(&image[sections..sections + 6], b".rdata");
    let rdata_va = u32_at(&image, sections + 12);
    let rdata_raw = u32_at(&image, sections + 20);
    assert_eq!(rdata_va, 0x1000);
    assert_eq!(rdata_raw, 0x200);

    let text = sections + 40;
    assert_eq!(&image[text..text + 5], b".text");
    let text_va = u32_at(&image, text + 12);
    let text_size = u32_at(&image, text + 8);
    assert_eq!(u32_at(&image, text + 36) & 0x2000_0020, 0x2000_0020, "code section");

    // The entry point lies inside .text.
    let entry = u32_at(&image, optional + 16);
    assert!(entry >= text_va && entry < text_va + text_size, "entry {entry:#x}");
}

#[test]
fn import_tables_are_populated() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let image = exit_code_image(&compilation, &info);

    let optional = 64 + 4 + 20;
    let rdata_sections = optional + 240;
    let rdata_va = u32_at(&image, rdata_sections + 12);
    let rdata_file = u32_at(&image, rdata_sections + 20);
    let to_file = |rva: u32| (rva - rdata_va + rdata_file) as usize;

    // Data directories: IAT (index 12), Import (index 1), Exception (3).
    let directories = optional + 112;
    let iat_rva = u32_at(&image, directories + 12 * 8);
    let iat_size = u32_at(&image, directories + 12 * 8 + 4);
    let import_rva = u32_at(&image, directories + 8);
    let exception_rva = u32_at(&image, directories + 3 * 8);
    assert_ne!(iat_rva, 0);
    // One slot plus the terminator.
    assert_eq!(iat_size, 16);
    assert_ne!(import_rva, 0);
    assert_ne!(exception_rva, 0);

    // The IAT slot refers to the hint/name entry: two hint bytes, then the
    // symbol name.
    let slot = u64::from_le_bytes(
        image[to_file(iat_rva)..to_file(iat_rva) + 8]
            .try_into()
            .unwrap(),
    );
    let hint_entry = to_file(slot as u32);
    assert_eq!(&image[hint_entry + 2..hint_entry + 13], b"ExitProcess");

    // The import descriptor names kernel32.dll and points back at the IAT.
    let descriptor = to_file(import_rva);
    let name_rva = u32_at(&image, descriptor + 12);
    let first_thunk = u32_at(&image, descriptor + 16);
    assert_eq!(first_thunk, iat_rva);
    let name = to_file(name_rva);
    assert_eq!(&image[name..name + 12], b"kernel32.dll");

    // The exception directory holds one RUNTIME_FUNCTION for the function.
    let runtime_function = to_file(exception_rva);
    let begin = u32_at(&image, runtime_function);
    let end = u32_at(&image, runtime_function + 4);
    let unwind = u32_at(&image, runtime_function + 8);
    assert!(end > begin);
    assert_ne!(unwind, 0);
}

#[test]
fn call_goes_through_the_iat_slot() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);
    let image = exit_code_image(&compilation, &info);

    let optional = 64 + 4 + 20;
    let directories = optional + 112;
    let iat_rva = u32_at(&image, directories + 12 * 8);

    let sections = optional + 240;
    let text = sections + 40;
    let text_va = u32_at(&image, text + 12);
    let text_size = u32_at(&image, text + 8);
    let text_file = u32_at(&image, text + 20) as usize;

    // Find `call [rip + disp32]` (FF 15) in the code and check that the
    // displacement lands exactly on the IAT slot.
    let code = &image[text_file..text_file + text_size as usize];
    let position = code
        .windows(2)
        .position(|window| window == [0xFF, 0x15])
        .expect("an indirect call through the IAT");
    let displacement = i32::from_le_bytes(code[position + 2..position + 6].try_into().unwrap());
    let next_instruction_rva = text_va + position as u32 + 6;
    assert_eq!(
        (next_instruction_rva as i64 + displacement as i64) as u32,
        iat_rva
    );
}

#[test]
fn static_data_lands_at_the_start_of_rdata() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);

    let mut program = Program::new(&CALLING_CONVENTION_X86_64_WINDOWS);
    let message = b"Hello, world!\n";
    program.append_data("greeting", message, 1);

    let setup = CALLING_CONVENTION_X86_64_WINDOWS
        .call_setup(&compilation, &info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, &info, setup);
    builder.end();
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let image = encode_executable(&mut program, ExecutableType::Gui).unwrap();

    let optional = 64 + 4 + 20;
    assert_eq!(u16_at(&image, optional + 68), 2, "GUI subsystem");
    let sections = optional + 240;
    let rdata_file = u32_at(&image, sections + 20) as usize;
    assert_eq!(&image[rdata_file..rdata_file + message.len()], message);
}

#[test]
fn write_executable_creates_the_file() {
    let compilation = Compilation::new();
    let info = FunctionInfo::new(vec![], &descriptor::VOID);

    let mut program = Program::new(&CALLING_CONVENTION_X86_64_WINDOWS);
    let _ = program.import_symbol("kernel32.dll", "ExitProcess");
    let setup = CALLING_CONVENTION_X86_64_WINDOWS
        .call_setup(&compilation, &info)
        .unwrap();
    let mut builder = FunctionBuilder::new(&mut program, &info, setup);
    builder.end();
    program.functions.push(builder);
    program.entry_point = Some(&info);

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("exit42.exe");
    write_executable(&mut program, ExecutableType::Cli, &path).unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[0..2], b"MZ");
    // Raw sections are file-alignment padded.
    assert_eq!(on_disk.len() % 0x200, 0);
}
