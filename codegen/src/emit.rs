//! Whole-function emission.
//!
//! Wraps a frozen [`FunctionBuilder`]'s instruction stream with the
//! prologue and epilogue its frame needs: non-volatile pushes in reverse
//! register order (the stack resolver counts them the same way), the frame
//! allocation, the body, the end label, the frame release, forward-order
//! pops and `ret`, with a trailing `int3` trap. Produces the layout record
//! the Windows unwind information is generated from.

use log::debug;

use crate::builder::FunctionBuilder;
use crate::encoder::encode_instruction;
use crate::error::{Result, SourceRange};
use crate::function::{FunctionFlags, FunctionLayout};
use crate::instruction::Instruction;
use crate::mnemonics;
use crate::program::{Program, SectionId};
use crate::storage::{
    Bits, MemoryLocation, Register, Storage, StorageKind, GENERAL_PURPOSE_REGISTERS,
};

pub fn encode_function<'c>(
    program: &mut Program<'c>,
    section: SectionId,
    builder: &mut FunctionBuilder<'c>,
) -> Result<FunctionLayout> {
    // Macro functions are expanded inline by the front end and never get a
    // body of their own.
    if builder.function.flags.contains(FunctionFlags::MACRO) {
        return Ok(FunctionLayout::default());
    }
    assert!(builder.frozen, "encoding an unfinished function");

    let mut layout = FunctionLayout {
        stack_reserve: builder.stack_reserve,
        ..FunctionLayout::default()
    };

    // Already encoded through another reference.
    if program.labels[builder.label].resolved {
        return Ok(layout);
    }

    let source_range = SourceRange::default();
    let base_rva = program.sections[section].base_rva;
    layout.begin_rva = base_rva + program.sections[section].current_offset();
    debug!(
        "encoding function {} at rva {:#x}",
        builder.label, layout.begin_rva
    );

    let emit = |program: &mut Program<'c>, instruction: Instruction<'c>| -> Result<()> {
        let mut instruction = instruction;
        encode_instruction(program, section, &mut instruction)
    };

    emit(program, Instruction::label(builder.label, source_range))?;

    // Push non-volatile registers in reverse order.
    let mut push_index = 0usize;
    for register in GENERAL_PURPOSE_REGISTERS.iter().rev() {
        if builder.used_register_bitset.contains(register.bit())
            && !builder.register_volatile_bitset.contains(register.bit())
        {
            layout.register_push_offsets[push_index] =
                (base_rva + program.sections[section].current_offset() - layout.begin_rva) as u8;
            push_index += 1;
            emit(
                program,
                Instruction::assembly(
                    &mnemonics::PUSH,
                    [
                        Storage::register(*register, Bits(64)),
                        Storage::none(),
                        Storage::none(),
                    ],
                    source_range,
                ),
            )?;
        }
    }
    layout.register_push_count = push_index as u8;

    let stack_size_operand = Storage::immediate_auto_8_or_32(builder.stack_reserve);
    let rsp = Storage::register(Register::Sp, Bits(64));
    emit(
        program,
        Instruction::assembly(
            &mnemonics::SUB,
            [rsp, stack_size_operand, Storage::none()],
            source_range,
        ),
    )?;
    let prolog_end =
        (base_rva + program.sections[section].current_offset() - layout.begin_rva) as u8;
    layout.stack_allocation_offset_in_prolog = prolog_end;
    layout.size_of_prolog = prolog_end;

    for instruction in &mut builder.code_block.instructions {
        encode_instruction(program, section, instruction)?;
    }

    emit(
        program,
        Instruction::label(builder.code_block.end_label, source_range),
    )?;

    // A larger-than-register return travels behind a pointer; the address
    // must come back to the caller in A.
    if builder.function.returns.byte_size() > 8 {
        if let StorageKind::Memory {
            location: MemoryLocation::Indirect { base, .. },
        } = builder.call_setup.callee_return.kind
        {
            if base != Register::A {
                emit(
                    program,
                    Instruction::assembly(
                        &mnemonics::MOV,
                        [
                            Storage::register(Register::A, Bits(64)),
                            Storage::register(base, Bits(64)),
                            Storage::none(),
                        ],
                        source_range,
                    ),
                )?;
            }
        }
    }

    emit(
        program,
        Instruction::assembly(
            &mnemonics::ADD,
            [rsp, stack_size_operand, Storage::none()],
            source_range,
        ),
    )?;

    // Pop non-volatile registers in forward order.
    for register in GENERAL_PURPOSE_REGISTERS {
        if builder.used_register_bitset.contains(register.bit())
            && !builder.register_volatile_bitset.contains(register.bit())
        {
            emit(
                program,
                Instruction::assembly(
                    &mnemonics::POP,
                    [
                        Storage::register(register, Bits(64)),
                        Storage::none(),
                        Storage::none(),
                    ],
                    source_range,
                ),
            )?;
        }
    }

    emit(
        program,
        Instruction::assembly(
            &mnemonics::RET,
            [Storage::none(), Storage::none(), Storage::none()],
            source_range,
        ),
    )?;
    layout.end_rva = base_rva + program.sections[section].current_offset();

    // Trap instead of falling into whatever comes next.
    emit(
        program,
        Instruction::assembly(
            &mnemonics::INT3,
            [Storage::none(), Storage::none(), Storage::none()],
            source_range,
        ),
    )?;

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CALLING_CONVENTION_X86_64_SYSTEM_V;
    use crate::descriptor;
    use crate::function::FunctionInfo;
    use crate::Compilation;

    #[test]
    fn prologue_and_epilogue_bracket_the_body() {
        let compilation = Compilation::new();
        let info = FunctionInfo::new(vec![], &descriptor::VOID);
        let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
        let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
            .call_setup(&compilation, &info)
            .unwrap();
        let mut builder = FunctionBuilder::new(&mut program, &info, setup);

        // Use a non-volatile register so the prologue pushes it.
        builder.register_acquire(Register::B);
        builder.register_release(Register::B);
        builder.end();

        let section = program.code_section;
        let layout = encode_function(&mut program, section, &mut builder).unwrap();

        let code = program.sections[section].buffer.clone();
        assert_eq!(layout.register_push_count, 1);
        // push rbx (with its REX.W, as the builder sizes registers at 64
        // bits), then sub rsp, imm8.
        assert_eq!(&code[0..2], &[0x48, 0x53]);
        assert_eq!(&code[2..5], &[0x48, 0x83, 0xEC]);
        // Epilogue ends with add rsp / pop rbx / ret and the trailing trap.
        assert_eq!(code[code.len() - 1], 0xCC);
        assert_eq!(code[code.len() - 2], 0xC3);
        assert_eq!(code[code.len() - 3], 0x5B);

        // Frame alignment: reserve + one push + return address.
        assert_eq!((layout.stack_reserve + 8 + 8) % 16, 0);
        assert_eq!(layout.begin_rva, 0);
        assert!(layout.end_rva > layout.begin_rva);
    }
}
