//! Windows x64 unwind information.
//!
//! One fixed-stride record per function so the `.rdata` array indexes
//! uniformly: the four header bytes plus room for the worst case of 16
//! register pushes and a large frame allocation.

use bytemuck::{Pod, Zeroable};
use mass_codegen::{FunctionBuilder, FunctionLayout};

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;

const UNWIND_INFO_VERSION: u8 = 1;
const MAX_UNWIND_CODES: usize = 32;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct UnwindInfo {
    pub version_and_flags: u8,
    pub size_of_prolog: u8,
    pub count_of_codes: u8,
    pub frame_register_and_offset: u8,
    pub codes: [u16; MAX_UNWIND_CODES],
}

fn unwind_code(code_offset: u8, operation: u8, operation_info: u8) -> u16 {
    u16::from_le_bytes([code_offset, operation | (operation_info << 4)])
}

/// Build the unwind record for one encoded function. Codes are listed in
/// reverse prologue order: the frame allocation first, then the pushes,
/// most recent first.
pub fn unwind_info_for_function(builder: &FunctionBuilder, layout: &FunctionLayout) -> UnwindInfo {
    let mut info = UnwindInfo {
        version_and_flags: UNWIND_INFO_VERSION,
        size_of_prolog: layout.size_of_prolog,
        count_of_codes: 0,
        frame_register_and_offset: 0,
        codes: [0; MAX_UNWIND_CODES],
    };
    let mut next = 0usize;

    let stack_reserve = layout.stack_reserve as u32;
    if stack_reserve > 0 {
        if stack_reserve <= 128 {
            info.codes[next] = unwind_code(
                layout.stack_allocation_offset_in_prolog,
                UWOP_ALLOC_SMALL,
                ((stack_reserve - 8) / 8) as u8,
            );
            next += 1;
        } else {
            info.codes[next] = unwind_code(
                layout.stack_allocation_offset_in_prolog,
                UWOP_ALLOC_LARGE,
                0,
            );
            info.codes[next + 1] = (stack_reserve / 8) as u16;
            next += 2;
        }
    }

    // Pushes happen from R15 down to A, so unwinding sees the low
    // registers first. Each `push r64` here is two bytes long; the
    // recorded offsets are instruction starts.
    let mut push_index = layout.register_push_count as usize;
    for register in mass_codegen::storage::GENERAL_PURPOSE_REGISTERS {
        if builder.used_register_bitset.contains(register.bit())
            && !builder.register_volatile_bitset.contains(register.bit())
        {
            push_index -= 1;
            let code_offset = layout.register_push_offsets[push_index] + 2;
            info.codes[next] = unwind_code(code_offset, UWOP_PUSH_NONVOL, register.hw_index());
            next += 1;
        }
    }
    debug_assert_eq!(push_index, 0);

    info.count_of_codes = next as u8;
    info
}
