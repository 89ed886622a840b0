//! End-of-function stack resolution.
//!
//! Until the whole body has been emitted, nobody knows how big the frame
//! is: locals grow downward, calls need outgoing-argument space, and
//! non-volatile register pushes shift everything. Once the function ends,
//! this pass fixes the frame size (with the ABI's 16-byte call-site
//! alignment), rewrites every symbolic stack displacement recorded by the
//! encoder, and shrinks 32-bit displacements to 8-bit ones where the final
//! value fits.

use log::debug;

use crate::builder::FunctionBuilder;
use crate::encoder::MOD_DISPLACEMENT_S8;
use crate::instruction::InstructionKind;
use crate::storage::{StackArea, GENERAL_PURPOSE_REGISTERS};

pub(crate) fn align_i32(value: i32, alignment: i32) -> i32 {
    debug_assert!(alignment > 0);
    (value + alignment - 1) / alignment * alignment
}

/// The final RSP-relative displacement for a symbolic stack reference.
fn adjust_stack_offset(
    area: StackArea,
    stack_offset: i32,
    stack_reserve: i32,
    argument_stack_base: i32,
) -> i32 {
    match area {
        StackArea::Local => {
            assert!(stack_offset < 0);
            stack_reserve + stack_offset
        }
        StackArea::ReceivedArgument => {
            assert!(stack_offset >= 0);
            argument_stack_base + stack_offset
        }
        StackArea::CallTargetArgument => {
            assert!(stack_offset >= 0);
            stack_offset
        }
        StackArea::Absolute => unreachable!("absolute offsets are never patched"),
    }
}

pub(crate) fn resolve_stack_frame(builder: &mut FunctionBuilder) {
    const REGISTER_SIZE: i32 = 8;

    // Pushes of non-volatile registers move RSP before the frame
    // allocation does.
    let mut push_size = 0;
    for register in GENERAL_PURPOSE_REGISTERS {
        if builder.used_register_bitset.contains(register.bit())
            && !builder.register_volatile_bitset.contains(register.bit())
        {
            push_size += REGISTER_SIZE;
        }
    }

    builder.stack_reserve += builder.max_call_parameters_stack_size as i32;

    // The stack at this point, from high to low addresses:
    //   > return address
    //   > saved non-volatile registers
    //   > locals and outgoing arguments
    // Locals are rounded up to register size; the total must leave RSP
    // 16-byte aligned at every call site after the return-address push.
    builder.stack_reserve = align_i32(builder.stack_reserve, REGISTER_SIZE);
    let return_address_size = REGISTER_SIZE;
    let mut argument_stack_base = builder.stack_reserve + push_size + return_address_size;
    if argument_stack_base % 16 != 0 {
        argument_stack_base += REGISTER_SIZE;
        builder.stack_reserve += REGISTER_SIZE;
    }
    debug!(
        "frame: reserve {} push {} argument base {}",
        builder.stack_reserve, push_size, argument_stack_base
    );

    let stack_reserve = builder.stack_reserve;
    let instructions = &mut builder.code_block.instructions;
    for index in 0..instructions.len() {
        let InstructionKind::StackPatch {
            mod_r_m_offset_in_previous_instruction,
            stack_area,
        } = instructions[index].kind
        else {
            continue;
        };
        assert!(index > 0, "a stack patch must follow the bytes it fixes");
        let previous = &mut instructions[index - 1];
        let InstructionKind::Bytes(bytes) = &mut previous.kind else {
            panic!("a stack patch must follow encoded bytes");
        };

        let mod_r_m_offset = mod_r_m_offset_in_previous_instruction as usize;
        // ModR/M, then the SIB byte every RSP-relative access carries, then
        // the 32-bit displacement.
        let displacement_offset = mod_r_m_offset + 2;
        let slot: [u8; 4] = bytes.memory[displacement_offset..displacement_offset + 4]
            .try_into()
            .unwrap();
        let resolved = adjust_stack_offset(
            stack_area,
            i32::from_le_bytes(slot),
            stack_reserve,
            argument_stack_base,
        );
        bytes.memory[displacement_offset..displacement_offset + 4]
            .copy_from_slice(&resolved.to_le_bytes());

        // Shrink the displacement to one byte when the final offset allows:
        // flip Mod to the disp8 form and pull the tail in by three bytes.
        if let Ok(resolved) = i8::try_from(resolved) {
            bytes.memory[mod_r_m_offset] &= 0b0011_1111;
            bytes.memory[mod_r_m_offset] |= MOD_DISPLACEMENT_S8 << 6;
            bytes.memory[displacement_offset] = resolved as u8;
            let length = bytes.length as usize;
            bytes
                .memory
                .copy_within(displacement_offset + 4..length, displacement_offset + 1);
            bytes.length -= 3;
            previous.encoded_byte_size -= 3;
            if let Some(label) = &mut bytes.label {
                if label.offset_in_instruction as usize > displacement_offset {
                    label.offset_in_instruction -= 3;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CALLING_CONVENTION_X86_64_SYSTEM_V;
    use crate::descriptor;
    use crate::error::SourceRange;
    use crate::function::FunctionInfo;
    use crate::mnemonics;
    use crate::program::Program;
    use crate::storage::{Bits, Register, Storage};
    use crate::Compilation;

    fn build_function<'c>(
        compilation: &'c Compilation,
        program: &mut Program<'c>,
        info: &'c FunctionInfo<'c>,
    ) -> FunctionBuilder<'c> {
        let setup = CALLING_CONVENTION_X86_64_SYSTEM_V
            .call_setup(compilation, info)
            .unwrap();
        FunctionBuilder::new(program, info, setup)
    }

    #[test]
    fn local_displacement_shrinks_to_disp8() {
        let compilation = Compilation::new();
        let info = FunctionInfo::new(vec![], &descriptor::VOID);
        let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
        let mut builder = build_function(&compilation, &mut program, &info);

        let local = builder.reserve_stack(&descriptor::S64);
        builder
            .push_assembly(
                &mnemonics::MOV,
                [
                    Storage::register(Register::A, Bits(64)),
                    local,
                    Storage::none(),
                ],
                SourceRange::default(),
            )
            .unwrap();

        let before = builder.code_block.instructions[0].encoded_byte_size;
        builder.end();
        let after = builder.code_block.instructions[0].encoded_byte_size;
        assert_eq!(before - after, 3);

        let InstructionKind::Bytes(bytes) = &builder.code_block.instructions[0].kind else {
            panic!("expected encoded bytes");
        };
        // Mod switched to the disp8 form.
        assert_eq!(bytes.memory[2] >> 6, MOD_DISPLACEMENT_S8);
        // One 8-byte local in an 8-byte frame: the local sits at [rsp + 0].
        assert_eq!(bytes.memory[4], 0);
    }

    #[test]
    fn frame_is_16_byte_aligned_at_call_sites() {
        let compilation = Compilation::new();
        let info = FunctionInfo::new(vec![], &descriptor::VOID);
        let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);

        for locals in 0..5 {
            let mut builder = build_function(&compilation, &mut program, &info);
            for _ in 0..locals {
                builder.reserve_stack(&descriptor::S64);
            }
            // Touch a non-volatile register so a push happens sometimes.
            if locals % 2 == 0 {
                builder.register_acquire(Register::B);
                builder.register_release(Register::B);
            }
            builder.end();

            let mut push_count = 0;
            for register in GENERAL_PURPOSE_REGISTERS {
                if builder.used_register_bitset.contains(register.bit())
                    && !builder.register_volatile_bitset.contains(register.bit())
                {
                    push_count += 1;
                }
            }
            assert_eq!(
                (builder.stack_reserve + 8 * push_count + 8) % 16,
                0,
                "locals = {}",
                locals
            );
        }
    }

    #[test]
    fn received_argument_offsets_include_frame_and_return_address() {
        let compilation = Compilation::new();
        let info = FunctionInfo::new(vec![], &descriptor::VOID);
        let mut program = Program::new(&CALLING_CONVENTION_X86_64_SYSTEM_V);
        let mut builder = build_function(&compilation, &mut program, &info);

        // As if reading the first stack-passed argument in the body.
        let argument = Storage::stack(crate::storage::StackArea::ReceivedArgument, 0, Bits(64));
        builder
            .push_assembly(
                &mnemonics::MOV,
                [
                    Storage::register(Register::A, Bits(64)),
                    argument,
                    Storage::none(),
                ],
                SourceRange::default(),
            )
            .unwrap();
        builder.end();

        let InstructionKind::Bytes(bytes) = &builder.code_block.instructions[0].kind else {
            panic!("expected encoded bytes");
        };
        let displacement = bytes.memory[4] as i32;
        assert_eq!(
            displacement,
            builder.stack_reserve + 8,
            "argument base accounts for the return address"
        );
    }
}
