//! Function descriptions handed over by the front end.

use crate::descriptor::Descriptor;
use crate::error::SourceRange;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FunctionFlags: u8 {
        /// Expanded inline by the front end; never encoded.
        const MACRO = 1 << 0;
        /// Only runs at compile time.
        const COMPILE_TIME = 1 << 1;
        /// Implemented by an imported symbol.
        const EXTERNAL = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FunctionParameter<'c> {
    pub name: &'c str,
    pub descriptor: &'c Descriptor<'c>,
    pub source_range: SourceRange,
}

/// Everything the backend needs to know about a function: its signature and
/// flags. The body arrives separately as an instruction stream.
#[derive(Clone, Debug)]
pub struct FunctionInfo<'c> {
    pub parameters: Vec<FunctionParameter<'c>>,
    pub returns: &'c Descriptor<'c>,
    pub flags: FunctionFlags,
}

impl<'c> FunctionInfo<'c> {
    pub fn new(parameters: Vec<FunctionParameter<'c>>, returns: &'c Descriptor<'c>) -> Self {
        FunctionInfo {
            parameters,
            returns,
            flags: FunctionFlags::empty(),
        }
    }
}

/// Prologue/epilogue geometry of an encoded function, consumed by the
/// Windows unwind-info generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionLayout {
    pub stack_reserve: i32,
    pub stack_allocation_offset_in_prolog: u8,
    pub size_of_prolog: u8,
    pub begin_rva: u32,
    pub end_rva: u32,
    /// Prologue offsets of the non-volatile register pushes, in push order.
    pub register_push_offsets: [u8; 16],
    pub register_push_count: u8,
}
