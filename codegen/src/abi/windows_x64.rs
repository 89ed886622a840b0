//! The Windows x64 calling convention.

use super::{
    ArgumentPlacement, ArgumentsLayoutItem, FunctionCallJump, FunctionCallSetup,
    CALLING_CONVENTION_X86_64_WINDOWS,
};
use crate::context::Compilation;
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::function::FunctionInfo;
use crate::storage::{Register, Storage, STORAGE_NONE};

const GENERAL_REGISTERS: [Register; 4] = [Register::C, Register::D, Register::R8, Register::R9];
const FLOAT_REGISTERS: [Register; 4] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
];

pub(super) fn call_setup<'c>(
    compilation: &'c Compilation,
    function: &'c FunctionInfo<'c>,
) -> Result<FunctionCallSetup<'c>> {
    let mut is_indirect_return = false;
    let (caller_return, callee_return) = match function.returns {
        Descriptor::Void => (STORAGE_NONE, STORAGE_NONE),
        returns if returns.is_float() => {
            let storage = Storage::register(Register::Xmm0, returns.bit_size());
            (storage, storage)
        }
        returns if returns.bit_size().0 > 64 => {
            // The caller allocates space and passes its address in C; the
            // callee echoes the address back in A.
            is_indirect_return = true;
            (
                Storage::indirect(returns.bit_size(), Register::A),
                Storage::indirect(returns.bit_size(), Register::C),
            )
        }
        returns => {
            let storage = Storage::register(Register::A, returns.bit_size());
            (storage, storage)
        }
    };

    let mut arguments_layout = Vec::with_capacity(function.parameters.len() + 1);
    // The hidden return pointer takes the first argument slot.
    let mut index = if is_indirect_return { 1 } else { 0 };

    for parameter in &function.parameters {
        let mut descriptor = parameter.descriptor;
        if descriptor.bit_size().0 > 64 {
            // Passed through a caller-allocated hidden pointer.
            descriptor = compilation.descriptor_pointer_to(parameter.descriptor);
        }
        let placement = if index < GENERAL_REGISTERS.len() {
            let register = if descriptor.is_float() {
                FLOAT_REGISTERS[index]
            } else {
                GENERAL_REGISTERS[index]
            };
            ArgumentPlacement::Absolute(Storage::register(register, descriptor.bit_size()))
        } else {
            ArgumentPlacement::BaseRelative {
                offset: (index * 8) as i32,
            }
        };
        arguments_layout.push(ArgumentsLayoutItem {
            name: parameter.name,
            descriptor,
            placement,
        });
        index += 1;
    }

    if is_indirect_return {
        arguments_layout.push(ArgumentsLayoutItem {
            name: "",
            descriptor: function.returns,
            placement: ArgumentPlacement::Absolute(Storage::indirect(
                function.returns.bit_size(),
                Register::C,
            )),
        });
    }

    // A home area for at least 4 arguments is always reserved.
    let parameters_stack_size = (function.parameters.len().max(4) * 8) as u32;

    Ok(FunctionCallSetup {
        jump: FunctionCallJump::Call,
        calling_convention: &CALLING_CONVENTION_X86_64_WINDOWS,
        caller_return,
        callee_return,
        arguments_layout,
        parameters_stack_size,
    })
}
