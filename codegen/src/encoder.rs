//! The instruction encoder.
//!
//! Translates one abstract assembly instruction into machine bytes: picks
//! the first matching encoding row, derives the operand-size prefix and the
//! REX byte, builds ModR/M and SIB, and emits displacement and immediates.
//! Label references are emitted as zeroed 32-bit slots with patch records
//! whose `from` anchor is the first byte of the *next* instruction, because
//! immediates may follow the patched slot.
//!
//! Operands referencing a symbolic stack area always get a 32-bit
//! displacement; the stack resolver rewrites (and possibly shrinks) it once
//! the frame layout is known.

use log::trace;
use smallvec::SmallVec;

use crate::encoding::{Extension, InstructionEncoding, Mnemonic, OperandClass, OperandSize};
use crate::error::{Error, ErrorKind, Result, SourceRange};
use crate::instruction::{
    Instruction, InstructionBytes, InstructionKind, MAX_INSTRUCTION_BYTES,
};
use crate::program::{Label, LabelDiffPatch, LabelLocation, Program, SectionId};
use crate::storage::{
    MemoryLocation, Register, StackArea, Storage, StorageKind,
};

pub(crate) const MOD_DISPLACEMENT_0: u8 = 0b00;
pub(crate) const MOD_DISPLACEMENT_S8: u8 = 0b01;
pub(crate) const MOD_DISPLACEMENT_S32: u8 = 0b10;
pub(crate) const MOD_REGISTER: u8 = 0b11;

const REX_W: u8 = 0b1000;
const REX_R: u8 = 0b0100;
const REX_X: u8 = 0b0010;
const REX_B: u8 = 0b0001;

#[inline]
fn encode_mod_r_m(m0d: u8, reg: u8, r_m: u8) -> u8 {
    ((m0d & 0b11) << 6) | ((reg & 0b111) << 3) | (r_m & 0b111)
}

#[inline]
fn encode_sib(scale: u8, index: u8, base: u8) -> u8 {
    ((scale & 0b11) << 6) | ((index & 0b111) << 3) | (base & 0b111)
}

/// A 32-bit slot inside an encoded instruction that references a label.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LabelUse {
    pub offset_in_instruction: u8,
    pub label: Label,
}

/// A 32-bit stack displacement to be rewritten by the stack resolver.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StackPatchSite {
    pub mod_r_m_offset: u8,
    pub area: StackArea,
}

/// One instruction's bytes plus the patch slots discovered while encoding.
#[derive(Debug)]
pub(crate) struct EncodedAssembly {
    pub bytes: SmallVec<[u8; MAX_INSTRUCTION_BYTES]>,
    pub mod_r_m_label: Option<LabelUse>,
    pub immediate_label: Option<LabelUse>,
    pub stack_patch: Option<StackPatchSite>,
}

fn operand_matches(operand: &Storage, encoding: &crate::encoding::OperandEncoding) -> bool {
    if let OperandSize::Fixed(size) = encoding.size {
        if operand.byte_size() != size as u32 {
            return false;
        }
    }
    match encoding.class {
        OperandClass::None => matches!(operand.kind, StorageKind::None),
        OperandClass::Eflags => matches!(operand.kind, StorageKind::Eflags { .. }),
        OperandClass::RegisterA => operand.is_register_index(Register::A),
        OperandClass::Register | OperandClass::OpCodePlusRegister => {
            matches!(operand.kind, StorageKind::Register { .. })
        }
        OperandClass::RegisterMemory => matches!(
            operand.kind,
            StorageKind::Register { .. } | StorageKind::Memory { .. }
        ),
        OperandClass::Memory => matches!(operand.kind, StorageKind::Memory { .. }),
        OperandClass::Xmm => matches!(operand.kind, StorageKind::Xmm { .. }),
        OperandClass::XmmMemory => matches!(
            operand.kind,
            StorageKind::Xmm { .. } | StorageKind::Memory { .. }
        ),
        OperandClass::Immediate => {
            if operand.is_immediate() {
                true
            } else {
                // A label participates as a 32-bit immediate only.
                operand.is_label() && encoding.size == OperandSize::Fixed(4)
            }
        }
    }
}

fn select_encoding(
    mnemonic: &'static Mnemonic,
    operands: &[Storage; 3],
) -> Option<&'static InstructionEncoding> {
    mnemonic.encodings.iter().find(|encoding| {
        operands
            .iter()
            .zip(encoding.operands.iter())
            .all(|(operand, operand_encoding)| operand_matches(operand, operand_encoding))
    })
}

enum Displacement {
    None,
    S8(i8),
    S32(i32),
    RipRelative(Label),
    /// Symbolic stack offset; emitted as 32 bits and patched later.
    Stack { offset: i32, area: StackArea },
}

/// Encode one assembly instruction into a fresh byte buffer. The caller
/// decides where the bytes land and turns the returned patch slots into
/// program-level patch records (or `StackPatch` markers).
pub(crate) fn encode_assembly(
    mnemonic: &'static Mnemonic,
    operands: &[Storage; 3],
    source_range: SourceRange,
) -> Result<EncodedAssembly> {
    let Some(encoding) = select_encoding(mnemonic, operands) else {
        return Err(Error::new(
            ErrorKind::NoMatchingEncoding {
                mnemonic: mnemonic.name.to_string(),
                operands: format!("{:?}", operands),
            },
            source_range,
        ));
    };

    let mut rex: u8 = 0;
    let mut needs_16_bit_prefix = false;
    let mut op_code = encoding.op_code;
    let mut reg_or_op_code: u8 = 0;
    let mut mod_r_m_operand_index: Option<usize> = None;
    let mut m0d: u8 = MOD_REGISTER;
    let mut r_m: u8 = 0;
    let mut needs_sib = false;
    let mut sib_byte: u8 = 0;
    let mut displacement = Displacement::None;

    for (operand_index, (operand, operand_encoding)) in operands
        .iter()
        .zip(encoding.operands.iter())
        .enumerate()
    {
        if operand.byte_size() == 2 {
            needs_16_bit_prefix = true;
        }
        if operand.byte_size() == 8
            && !matches!(
                operand_encoding.class,
                OperandClass::Xmm | OperandClass::XmmMemory
            )
        {
            rex |= REX_W;
        }

        match operand.kind {
            StorageKind::Register { index } => {
                let uses_op_code_register = matches!(
                    operand_encoding.class,
                    OperandClass::OpCodePlusRegister
                ) || matches!(encoding.extension, Extension::PlusRegister)
                    && matches!(operand_encoding.class, OperandClass::Register);
                if uses_op_code_register {
                    op_code[3] += index.hw_index() & 0b111;
                    if index.hw_index() & 0b1000 != 0 {
                        rex |= REX_B;
                    }
                } else if matches!(operand_encoding.class, OperandClass::Register) {
                    debug_assert!(!matches!(encoding.extension, Extension::OpCode(_)));
                    reg_or_op_code = index.hw_index();
                    if index.hw_index() & 0b1000 != 0 {
                        rex |= REX_R;
                    }
                }
            }
            StorageKind::Xmm { index } => {
                if matches!(operand_encoding.class, OperandClass::Xmm)
                    && matches!(encoding.extension, Extension::Register)
                {
                    reg_or_op_code = index.hw_index();
                    if index.hw_index() & 0b1000 != 0 {
                        rex |= REX_R;
                    }
                }
            }
            _ => {}
        }

        if matches!(
            operand_encoding.class,
            OperandClass::Memory | OperandClass::RegisterMemory | OperandClass::XmmMemory
        ) {
            assert!(
                mod_r_m_operand_index.is_none(),
                "multiple ModR/M operands in one instruction"
            );
            mod_r_m_operand_index = Some(operand_index);
            match operand.kind {
                StorageKind::Register { index } | StorageKind::Xmm { index } => {
                    r_m = index.hw_index();
                    m0d = MOD_REGISTER;
                }
                StorageKind::Memory { location } => match location {
                    MemoryLocation::InstructionPointerRelative { label } => {
                        r_m = 0b101;
                        m0d = MOD_DISPLACEMENT_0;
                        displacement = Displacement::RipRelative(label);
                    }
                    MemoryLocation::Indirect {
                        base,
                        index,
                        offset,
                        area,
                    } => {
                        assert!(!base.is_xmm(), "indirect base must be general-purpose");
                        // SIB scales other than 1 are not supported.
                        const SIB_SCALE_1: u8 = 0b00;
                        if let Some(index_register) = index {
                            assert!(index_register != Register::Sp, "rsp can not be an index");
                            needs_sib = true;
                            r_m = 0b100;
                            sib_byte = encode_sib(
                                SIB_SCALE_1,
                                index_register.hw_index(),
                                base.hw_index(),
                            );
                            if index_register.hw_index() & 0b1000 != 0 {
                                rex |= REX_X;
                            }
                            if base.hw_index() & 0b1000 != 0 {
                                rex |= REX_B;
                            }
                        } else if base.hw_index() & 0b111 == 0b100 {
                            // [rsp/r12 + X] always needs a SIB byte because
                            // their r/m encoding is the SIB escape. Index
                            // 0b100 in the SIB byte means "no index".
                            needs_sib = true;
                            r_m = 0b100;
                            sib_byte = encode_sib(SIB_SCALE_1, 0b100, base.hw_index());
                            if base.hw_index() & 0b1000 != 0 {
                                rex |= REX_B;
                            }
                        } else {
                            r_m = base.hw_index();
                        }

                        if area != StackArea::Absolute {
                            // Final frame offsets are unknown until every
                            // instruction is emitted, so reserve the wide
                            // form unconditionally.
                            m0d = MOD_DISPLACEMENT_S32;
                            displacement = Displacement::Stack { offset, area };
                        } else if offset == 0 && base.hw_index() & 0b111 != 0b101 {
                            m0d = MOD_DISPLACEMENT_0;
                        } else if let Ok(offset) = i8::try_from(offset) {
                            // [rbp/r13 + 0] is unencodable with mod=00, so a
                            // zero displacement still takes the disp8 form.
                            m0d = MOD_DISPLACEMENT_S8;
                            displacement = Displacement::S8(offset);
                        } else {
                            m0d = MOD_DISPLACEMENT_S32;
                            displacement = Displacement::S32(offset);
                        }
                    }
                },
                _ => unreachable!("operand matched a memory class without a location"),
            }
        }
    }

    if let Extension::OpCode(digit) = encoding.extension {
        reg_or_op_code = digit;
    }

    if r_m & 0b1000 != 0 {
        rex |= REX_B;
    }

    let mut bytes: SmallVec<[u8; MAX_INSTRUCTION_BYTES]> = SmallVec::new();
    if rex != 0 {
        bytes.push(0x40 | rex);
    }
    if needs_16_bit_prefix {
        bytes.push(0x66);
    }
    for &byte in &op_code[..3] {
        if byte != 0 {
            bytes.push(byte);
        }
    }
    bytes.push(op_code[3]);

    let mut mod_r_m_offset = None;
    if mod_r_m_operand_index.is_some() {
        mod_r_m_offset = Some(bytes.len() as u8);
        bytes.push(encode_mod_r_m(m0d, reg_or_op_code, r_m));
        if needs_sib {
            bytes.push(sib_byte);
        }
    }

    let mut mod_r_m_label = None;
    let mut stack_patch = None;
    match displacement {
        Displacement::None => {}
        Displacement::S8(value) => bytes.push(value as u8),
        Displacement::S32(value) => bytes.extend_from_slice(&value.to_le_bytes()),
        Displacement::RipRelative(label) => {
            mod_r_m_label = Some(LabelUse {
                offset_in_instruction: bytes.len() as u8,
                label,
            });
            bytes.extend_from_slice(&0i32.to_le_bytes());
        }
        Displacement::Stack { offset, area } => {
            stack_patch = Some(StackPatchSite {
                mod_r_m_offset: mod_r_m_offset.expect("stack displacement without ModR/M"),
                area,
            });
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
    }

    let mut immediate_label = None;
    for (operand, operand_encoding) in operands.iter().zip(encoding.operands.iter()) {
        if !matches!(operand_encoding.class, OperandClass::Immediate) {
            continue;
        }
        if operand.is_label() {
            let StorageKind::Memory {
                location: MemoryLocation::InstructionPointerRelative { label },
            } = operand.kind
            else {
                unreachable!();
            };
            immediate_label = Some(LabelUse {
                offset_in_instruction: bytes.len() as u8,
                label,
            });
            bytes.extend_from_slice(&0i32.to_le_bytes());
        } else if operand.is_immediate() {
            bytes.extend_from_slice(&operand.immediate_bytes());
        } else {
            unreachable!("mismatched operand for an immediate encoding slot");
        }
    }

    debug_assert!(bytes.len() <= MAX_INSTRUCTION_BYTES);
    trace!("encoded {} as {:02x?}", mnemonic.name, &bytes[..]);

    Ok(EncodedAssembly {
        bytes,
        mod_r_m_label,
        immediate_label,
        stack_patch,
    })
}

/// Encode an assembly instruction that references a symbolic stack area
/// into raw [`InstructionBytes`] plus the stack-patch marker to append
/// right after it.
pub(crate) fn encode_assembly_to_bytes(
    mnemonic: &'static Mnemonic,
    operands: &[Storage; 3],
    source_range: SourceRange,
) -> Result<(InstructionBytes, Option<StackPatchSite>)> {
    let encoded = encode_assembly(mnemonic, operands, source_range)?;
    debug_assert!(
        encoded.mod_r_m_label.is_none(),
        "a symbolic stack operand precludes a second memory operand"
    );
    let mut memory = [0u8; MAX_INSTRUCTION_BYTES];
    memory[..encoded.bytes.len()].copy_from_slice(&encoded.bytes);
    let bytes = InstructionBytes {
        memory,
        length: encoded.bytes.len() as u8,
        label: encoded.immediate_label.map(|label_use| {
            crate::instruction::InstructionBytesLabel {
                offset_in_instruction: label_use.offset_in_instruction,
                label: label_use.label,
            }
        }),
    };
    Ok((bytes, encoded.stack_patch))
}

/// Append the machine bytes for `instruction` to `section`'s buffer,
/// recording label patches in the program and the encoded length on the
/// instruction.
pub fn encode_instruction<'c>(
    program: &mut Program<'c>,
    section: SectionId,
    instruction: &mut Instruction<'c>,
) -> Result<()> {
    let start_offset = program.sections[section].current_offset();
    match instruction.kind {
        InstructionKind::Label { index } => {
            program.set_label_offset(index, start_offset);
            instruction.encoded_byte_size = 0;
        }
        InstructionKind::Bytes(bytes) => {
            program.sections[section]
                .buffer
                .extend_from_slice(bytes.bytes());
            let end_offset = program.sections[section].current_offset();
            if let Some(label_use) = bytes.label {
                program.record_patch(LabelDiffPatch {
                    target: label_use.label,
                    from: LabelLocation {
                        section,
                        offset: end_offset,
                    },
                    patch_at: LabelLocation {
                        section,
                        offset: start_offset + label_use.offset_in_instruction as u32,
                    },
                });
            }
            instruction.encoded_byte_size = bytes.length;
        }
        InstructionKind::LabelPatch { offset, label } => {
            let patch_offset = start_offset as i64 + offset as i64;
            assert!(patch_offset >= 0);
            program.record_patch(LabelDiffPatch {
                target: label,
                from: LabelLocation {
                    section,
                    offset: start_offset,
                },
                patch_at: LabelLocation {
                    section,
                    offset: patch_offset as u32,
                },
            });
            instruction.encoded_byte_size = 0;
        }
        InstructionKind::StackPatch { .. } => {
            // Applied by the stack resolver before encoding; nothing to emit.
            instruction.encoded_byte_size = 0;
        }
        InstructionKind::Assembly { mnemonic, operands } => {
            let encoded = encode_assembly(mnemonic, &operands, instruction.source_range)?;
            if encoded.stack_patch.is_some() {
                return Err(Error::new(
                    ErrorKind::Unimplemented(
                        "symbolic stack operand reached final encoding unresolved".to_string(),
                    ),
                    instruction.source_range,
                ));
            }
            program.sections[section]
                .buffer
                .extend_from_slice(&encoded.bytes);
            let end_offset = program.sections[section].current_offset();
            // Label diffs are measured from the byte after this instruction,
            // which is only known once the immediates are in.
            for label_use in [encoded.mod_r_m_label, encoded.immediate_label]
                .into_iter()
                .flatten()
            {
                program.record_patch(LabelDiffPatch {
                    target: label_use.label,
                    from: LabelLocation {
                        section,
                        offset: end_offset,
                    },
                    patch_at: LabelLocation {
                        section,
                        offset: start_offset + label_use.offset_in_instruction as u32,
                    },
                });
            }
            instruction.encoded_byte_size = encoded.bytes.len() as u8;
        }
    }
    Ok(())
}
