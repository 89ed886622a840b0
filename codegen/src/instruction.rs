//! The instruction stream model.
//!
//! A function body is an ordered vector of [`Instruction`]s. Most are
//! abstract [`InstructionKind::Assembly`] entries encoded at emission time;
//! instructions whose operands reference symbolic stack areas are encoded
//! into [`InstructionKind::Bytes`] as they are pushed, followed by a
//! [`InstructionKind::StackPatch`] marker the stack resolver rewrites once
//! the frame layout is final.

use crate::encoding::Mnemonic;
use crate::error::SourceRange;
use crate::program::Label;
use crate::storage::{StackArea, Storage};

/// The longest legal x86-64 instruction.
pub const MAX_INSTRUCTION_BYTES: usize = 15;

/// A label referenced from inside an already-encoded [`InstructionBytes`].
#[derive(Clone, Copy, Debug)]
pub struct InstructionBytesLabel {
    /// Offset of the 32-bit patch slot from the start of the instruction.
    pub offset_in_instruction: u8,
    pub label: Label,
}

/// Raw machine bytes, optionally carrying an embedded label patch slot.
#[derive(Clone, Copy, Debug)]
pub struct InstructionBytes {
    pub memory: [u8; MAX_INSTRUCTION_BYTES],
    pub length: u8,
    pub label: Option<InstructionBytesLabel>,
}

impl InstructionBytes {
    pub fn bytes(&self) -> &[u8] {
        &self.memory[..self.length as usize]
    }
}

#[derive(Clone, Copy, Debug)]
pub enum InstructionKind<'c> {
    /// An abstract instruction, encoded when the function is emitted.
    Assembly {
        mnemonic: &'static Mnemonic,
        operands: [Storage<'c>; 3],
    },
    /// Resolves the label to the current position in the section; emits no
    /// bytes.
    Label { index: Label },
    /// Already-encoded machine bytes.
    Bytes(InstructionBytes),
    /// Records a label patch at `offset` bytes from the current position;
    /// emits no bytes.
    LabelPatch { offset: i32, label: Label },
    /// Marks a 32-bit stack displacement inside the immediately preceding
    /// [`InstructionKind::Bytes`] for the stack resolver to rewrite.
    StackPatch {
        mod_r_m_offset_in_previous_instruction: u8,
        stack_area: StackArea,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct Instruction<'c> {
    pub kind: InstructionKind<'c>,
    pub source_range: SourceRange,
    /// Set by the encoder; consumers such as unwind info need the final
    /// instruction lengths.
    pub encoded_byte_size: u8,
}

impl<'c> Instruction<'c> {
    pub fn assembly(
        mnemonic: &'static Mnemonic,
        operands: [Storage<'c>; 3],
        source_range: SourceRange,
    ) -> Self {
        Instruction {
            kind: InstructionKind::Assembly { mnemonic, operands },
            source_range,
            encoded_byte_size: 0,
        }
    }

    pub fn label(index: Label, source_range: SourceRange) -> Self {
        Instruction {
            kind: InstructionKind::Label { index },
            source_range,
            encoded_byte_size: 0,
        }
    }
}
