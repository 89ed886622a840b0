//! The function builder.
//!
//! A [`FunctionBuilder`] accumulates the instruction stream for one
//! function, tracks which registers are in use, and hands out stack slots.
//! Register management is scratch-grained: expressions acquire temporaries
//! and must release them, so occupancy always returns to its pre-expression
//! state.

use cranelift_bitset::ScalarBitSet;
use log::trace;

use crate::abi::FunctionCallSetup;
use crate::descriptor::Descriptor;
use crate::encoder;
use crate::error::{Error, ErrorKind, Result, SourceRange};
use crate::frame;
use crate::function::FunctionInfo;
use crate::instruction::{Instruction, InstructionKind};
use crate::mnemonics;
use crate::program::{Label, Program};
use crate::storage::{
    Bits, MemoryLocation, Register, StackArea, Storage, StorageKind,
};

/// Temporary-register preference order. A is excluded because parts of the
/// lowering hard-code it; SP/BP/SI/DI never serve as scratch.
const TEMPORARY_REGISTERS: [Register; 11] = [
    Register::C,
    Register::B,
    Register::D,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

pub struct CodeBlock<'c> {
    pub end_label: Label,
    pub instructions: Vec<Instruction<'c>>,
}

pub struct FunctionBuilder<'c> {
    pub function: &'c FunctionInfo<'c>,
    pub call_setup: FunctionCallSetup<'c>,
    pub label: Label,
    pub code_block: CodeBlock<'c>,
    /// Every register any emitted instruction has touched; monotonic, drives
    /// the prologue save/restore.
    pub used_register_bitset: ScalarBitSet<u32>,
    /// Registers currently holding a live value; always a subset of the used
    /// set.
    pub register_occupied_bitset: ScalarBitSet<u32>,
    pub register_volatile_bitset: ScalarBitSet<u32>,
    /// Bytes of locals reserved so far; grows downward from RSP.
    pub stack_reserve: i32,
    /// The widest outgoing-argument area any call in the body needs.
    pub max_call_parameters_stack_size: u32,
    pub frozen: bool,
}

/// A fixed register acquired for an instruction that demands it, together
/// with the scratch copy of its previous occupant, if one had to be made.
pub struct MaybeSavedRegister {
    pub index: Register,
    pub saved_index: Option<Register>,
    pub source_range: SourceRange,
}

impl<'c> FunctionBuilder<'c> {
    pub fn new(
        program: &mut Program<'c>,
        function: &'c FunctionInfo<'c>,
        call_setup: FunctionCallSetup<'c>,
    ) -> Self {
        let code_section = program.code_section;
        let label = program.make_label(code_section, "fn");
        let end_label = program.make_label(code_section, "fn end");
        let register_volatile_bitset =
            ScalarBitSet(call_setup.calling_convention.register_volatile_bitset);
        FunctionBuilder {
            function,
            call_setup,
            label,
            code_block: CodeBlock {
                end_label,
                instructions: Vec::new(),
            },
            used_register_bitset: ScalarBitSet::new(),
            register_occupied_bitset: ScalarBitSet::new(),
            register_volatile_bitset,
            stack_reserve: 0,
            max_call_parameters_stack_size: 0,
            frozen: false,
        }
    }

    /// Append an instruction. Assembly instructions whose operands
    /// reference a symbolic stack area are encoded to raw bytes here, with
    /// a stack-patch marker for the resolver, because their displacement
    /// slots must exist before the frame layout is decided.
    pub fn push_instruction(&mut self, instruction: Instruction<'c>) -> Result<()> {
        assert!(!self.frozen, "pushed an instruction into a frozen function");
        if let InstructionKind::Assembly { mnemonic, operands } = instruction.kind {
            let has_symbolic_stack_operand = operands.iter().any(|operand| {
                matches!(
                    operand.kind,
                    StorageKind::Memory {
                        location: MemoryLocation::Indirect { area, .. }
                    } if area != StackArea::Absolute
                )
            });
            if has_symbolic_stack_operand {
                let (bytes, stack_patch) = encoder::encode_assembly_to_bytes(
                    mnemonic,
                    &operands,
                    instruction.source_range,
                )?;
                let length = bytes.length;
                self.code_block.instructions.push(Instruction {
                    kind: InstructionKind::Bytes(bytes),
                    source_range: instruction.source_range,
                    encoded_byte_size: length,
                });
                if let Some(site) = stack_patch {
                    self.code_block.instructions.push(Instruction {
                        kind: InstructionKind::StackPatch {
                            mod_r_m_offset_in_previous_instruction: site.mod_r_m_offset,
                            stack_area: site.area,
                        },
                        source_range: instruction.source_range,
                        encoded_byte_size: 0,
                    });
                }
                return Ok(());
            }
        }
        self.code_block.instructions.push(instruction);
        Ok(())
    }

    pub fn push_assembly(
        &mut self,
        mnemonic: &'static crate::encoding::Mnemonic,
        operands: [Storage<'c>; 3],
        source_range: SourceRange,
    ) -> Result<()> {
        self.push_instruction(Instruction::assembly(mnemonic, operands, source_range))
    }

    pub fn push_label(&mut self, label: Label, source_range: SourceRange) -> Result<()> {
        self.push_instruction(Instruction::label(label, source_range))
    }

    /// Reserve a stack slot for a value of the given type and return its
    /// symbolic storage. The final RSP-relative offset is fixed by the
    /// stack resolver when the function ends.
    pub fn reserve_stack(&mut self, descriptor: &Descriptor) -> Storage<'c> {
        let byte_size = descriptor.byte_size() as i32;
        let alignment = descriptor.byte_alignment().max(1) as i32;
        self.stack_reserve = frame::align_i32(self.stack_reserve, alignment);
        self.stack_reserve += byte_size;
        Storage::stack(StackArea::Local, -self.stack_reserve, descriptor.bit_size())
    }

    pub fn register_occupied(&self, register: Register) -> bool {
        self.register_occupied_bitset.contains(register.bit())
    }

    pub fn register_acquire(&mut self, register: Register) {
        assert!(
            !self.register_occupied(register),
            "{} is already occupied",
            register
        );
        self.used_register_bitset.insert(register.bit());
        self.register_occupied_bitset.insert(register.bit());
        trace!("acquired {}", register);
    }

    /// Claim any currently free scratch register.
    pub fn register_acquire_temp(&mut self, source_range: SourceRange) -> Result<Register> {
        self.register_acquire_temp_disallowing(&[], source_range)
    }

    pub fn register_acquire_temp_disallowing(
        &mut self,
        disallowed: &[Register],
        source_range: SourceRange,
    ) -> Result<Register> {
        for register in TEMPORARY_REGISTERS {
            if disallowed.contains(&register) {
                continue;
            }
            if !self.register_occupied(register) {
                self.register_acquire(register);
                return Ok(register);
            }
        }
        Err(Error::new(
            ErrorKind::Unimplemented("ran out of temporary registers".to_string()),
            source_range,
        ))
    }

    pub fn register_release(&mut self, register: Register) {
        assert!(
            self.register_occupied(register),
            "released {} which is not occupied",
            register
        );
        self.register_occupied_bitset.remove(register.bit());
        trace!("released {}", register);
    }

    /// Claim a specific register, moving its current occupant to a scratch
    /// register first if necessary. The returned handle replays the
    /// restoring move on release.
    pub fn register_acquire_maybe_save_if_already_acquired(
        &mut self,
        register: Register,
        source_range: SourceRange,
    ) -> Result<MaybeSavedRegister> {
        if !self.register_occupied(register) {
            self.register_acquire(register);
            return Ok(MaybeSavedRegister {
                index: register,
                saved_index: None,
                source_range,
            });
        }
        let saved = self.register_acquire_temp(source_range)?;
        self.push_assembly(
            &mnemonics::MOV,
            [
                Storage::register(saved, Bits(64)),
                Storage::register(register, Bits(64)),
                Storage::none(),
            ],
            source_range,
        )?;
        Ok(MaybeSavedRegister {
            index: register,
            saved_index: Some(saved),
            source_range,
        })
    }

    pub fn register_release_maybe_restore(
        &mut self,
        maybe_saved: &MaybeSavedRegister,
    ) -> Result<()> {
        match maybe_saved.saved_index {
            None => self.register_release(maybe_saved.index),
            Some(saved) => {
                // The register still belongs to its original occupant; put
                // the value back and drop only the scratch claim.
                self.push_assembly(
                    &mnemonics::MOV,
                    [
                        Storage::register(maybe_saved.index, Bits(64)),
                        Storage::register(saved, Bits(64)),
                        Storage::none(),
                    ],
                    maybe_saved.source_range,
                )?;
                self.register_release(saved);
            }
        }
        Ok(())
    }

    /// Emit the canonical move between two storages, inserting scratch
    /// registers, sign extensions or a block copy as the pair requires.
    pub fn move_value(
        &mut self,
        source_range: SourceRange,
        target: &Storage<'c>,
        source: &Storage<'c>,
    ) -> Result<()> {
        if target == source {
            return Ok(());
        }
        if matches!(target.kind, StorageKind::Eflags { .. }) {
            return Err(Error::unimplemented("moving into EFLAGS", source_range));
        }

        let target_size = target.byte_size();
        let source_size = source.byte_size();

        if matches!(target.kind, StorageKind::Xmm { .. })
            || matches!(source.kind, StorageKind::Xmm { .. })
        {
            if target_size != source_size {
                return Err(Error::unimplemented(
                    "resizing a floating-point move",
                    source_range,
                ));
            }
            let mnemonic = match target_size {
                4 => &mnemonics::MOVSS,
                8 => &mnemonics::MOVSD,
                _ => {
                    return Err(Error::unimplemented(
                        "SSE move of an unexpected size",
                        source_range,
                    ))
                }
            };
            return self.push_assembly(
                mnemonic,
                [*target, *source, Storage::none()],
                source_range,
            );
        }

        if let StorageKind::Eflags { compare_type } = source.kind {
            assert!(target.is_register_or_memory());
            let (temp, acquired) = if target_size == 1 {
                (*target, None)
            } else {
                let register = self.register_acquire_temp(source_range)?;
                (Storage::register(register, Bits(8)), Some(register))
            };
            self.push_assembly(
                mnemonics::setcc_for_compare(compare_type),
                [temp, *source, Storage::none()],
                source_range,
            )?;
            if let Some(register) = acquired {
                let resized = Storage::register(register, target.bit_size);
                self.push_assembly(
                    &mnemonics::MOVSX,
                    [resized, temp, Storage::none()],
                    source_range,
                )?;
                self.move_value(source_range, target, &resized)?;
                self.register_release(register);
            }
            return Ok(());
        }

        if source.is_immediate() {
            let immediate = source.immediate_value_up_to_s64();
            if immediate == 0 && matches!(target.kind, StorageKind::Register { .. }) {
                // This clobbers the flags, so comparisons must be emitted
                // after the moves they depend on.
                return self.push_assembly(
                    &mnemonics::XOR,
                    [*target, *target, Storage::none()],
                    source_range,
                );
            }
            let adjusted_source = match target_size {
                1 => Storage::immediate_s8(immediate as i8),
                2 => Storage::immediate_s16(immediate as i16),
                4 => Storage::immediate_s32(immediate as i32),
                8 => {
                    if let Ok(value) = i32::try_from(immediate) {
                        Storage::immediate_s32(value)
                    } else {
                        Storage::immediate_s64(immediate)
                    }
                }
                _ => {
                    return Err(Error::unimplemented(
                        "immediate move of an unexpected size",
                        source_range,
                    ))
                }
            };
            // The 15-byte instruction limit rules out a 64-bit immediate
            // store to memory, so it detours through a register.
            let is_64_bit_immediate = adjusted_source.byte_size() == 8;
            if is_64_bit_immediate && !matches!(target.kind, StorageKind::Register { .. }) {
                let register = self.register_acquire_temp(source_range)?;
                let temp = Storage::register(register, adjusted_source.bit_size);
                self.push_assembly(
                    &mnemonics::MOV,
                    [temp, adjusted_source, Storage::none()],
                    source_range,
                )?;
                self.push_assembly(
                    &mnemonics::MOV,
                    [*target, temp, Storage::none()],
                    source_range,
                )?;
                self.register_release(register);
            } else {
                self.push_assembly(
                    &mnemonics::MOV,
                    [*target, adjusted_source, Storage::none()],
                    source_range,
                )?;
            }
            return Ok(());
        }

        if target_size != source_size {
            if source_size > target_size {
                return Err(Error::unimplemented(
                    "narrowing move between operands",
                    source_range,
                ));
            }
            if let StorageKind::Register { index } = target.kind {
                if source_size == 4 {
                    // A 32-bit register write clears the upper half.
                    let adjusted_target = Storage::register(index, Bits(32));
                    self.push_assembly(
                        &mnemonics::MOV,
                        [adjusted_target, *source, Storage::none()],
                        source_range,
                    )?;
                } else {
                    self.push_assembly(
                        &mnemonics::MOVSX,
                        [*target, *source, Storage::none()],
                        source_range,
                    )?;
                }
            } else {
                let register = self.register_acquire_temp(source_range)?;
                let temp = Storage::register(register, target.bit_size);
                self.push_assembly(
                    &mnemonics::MOVSX,
                    [temp, *source, Storage::none()],
                    source_range,
                )?;
                self.push_assembly(
                    &mnemonics::MOV,
                    [*target, temp, Storage::none()],
                    source_range,
                )?;
                self.register_release(register);
            }
            return Ok(());
        }

        if matches!(target.kind, StorageKind::Memory { .. })
            && matches!(source.kind, StorageKind::Memory { .. })
        {
            if target_size >= 16 {
                return self.copy_memory_with_rep_movsb(source_range, target, source);
            }
            let register = self.register_acquire_temp(source_range)?;
            let temp = Storage::register(register, target.bit_size);
            self.move_value(source_range, &temp, source)?;
            self.move_value(source_range, target, &temp)?;
            self.register_release(register);
            return Ok(());
        }

        self.push_assembly(&mnemonics::MOV, [*target, *source, Storage::none()], source_range)
    }

    /// Block copy for memory-to-memory moves of 16 bytes and up: save
    /// RSI/RDI/RCX, point them at the operands, `rep movsb`, restore.
    fn copy_memory_with_rep_movsb(
        &mut self,
        source_range: SourceRange,
        target: &Storage<'c>,
        source: &Storage<'c>,
    ) -> Result<()> {
        // The string registers themselves must stay out of the scratch set
        // or the saved values would be clobbered below.
        let disallowed = [Register::C, Register::Si, Register::Di];
        let temp_rsi =
            self.register_acquire_temp_disallowing(&disallowed, source_range)?;
        let temp_rdi =
            self.register_acquire_temp_disallowing(&disallowed, source_range)?;
        let temp_rcx =
            self.register_acquire_temp_disallowing(&disallowed, source_range)?;

        let reg_rsi = Storage::register(Register::Si, Bits(64));
        let reg_rdi = Storage::register(Register::Di, Bits(64));
        let reg_rcx = Storage::register(Register::C, Bits(64));
        let save_rsi = Storage::register(temp_rsi, Bits(64));
        let save_rdi = Storage::register(temp_rdi, Bits(64));
        let save_rcx = Storage::register(temp_rcx, Bits(64));

        self.move_value(source_range, &save_rsi, &reg_rsi)?;
        self.move_value(source_range, &save_rdi, &reg_rdi)?;
        self.move_value(source_range, &save_rcx, &reg_rcx)?;

        self.push_assembly(&mnemonics::LEA, [reg_rsi, *source, Storage::none()], source_range)?;
        self.push_assembly(&mnemonics::LEA, [reg_rdi, *target, Storage::none()], source_range)?;
        let count = Storage::immediate_s64(target.byte_size() as i64);
        self.move_value(source_range, &reg_rcx, &count)?;
        self.push_assembly(
            &mnemonics::REP_MOVSB,
            [Storage::none(), Storage::none(), Storage::none()],
            source_range,
        )?;

        self.move_value(source_range, &reg_rsi, &save_rsi)?;
        self.move_value(source_range, &reg_rdi, &save_rdi)?;
        self.move_value(source_range, &reg_rcx, &save_rcx)?;

        self.register_release(temp_rsi);
        self.register_release(temp_rdi);
        self.register_release(temp_rcx);
        Ok(())
    }

    /// `lea` the address of a memory operand into the result, via a scratch
    /// register when the result is not one.
    pub fn load_address(
        &mut self,
        source_range: SourceRange,
        result: &Storage<'c>,
        memory: &Storage<'c>,
    ) -> Result<()> {
        assert!(matches!(memory.kind, StorageKind::Memory { .. }));
        let (temp, acquired) = match result.kind {
            StorageKind::Register { .. } => (*result, None),
            _ => {
                let register = self.register_acquire_temp(source_range)?;
                (Storage::register(register, Bits(64)), Some(register))
            }
        };
        // The operand is an opaque address: its own width must not steer
        // the instruction encoding.
        let mut address_operand = *memory;
        address_operand.bit_size = Bits(64);
        self.push_assembly(
            &mnemonics::LEA,
            [temp, address_operand, Storage::none()],
            source_range,
        )?;
        if let Some(register) = acquired {
            self.move_value(source_range, result, &temp)?;
            self.register_release(register);
        }
        Ok(())
    }

    /// Record a call's outgoing-argument area so the frame reserves the
    /// widest one.
    pub fn note_call_parameters_stack_size(&mut self, size: u32) {
        self.max_call_parameters_stack_size = self.max_call_parameters_stack_size.max(size);
    }

    fn remove_unnecessary_jump_to_end(&mut self) {
        let Some(last) = self.code_block.instructions.last() else {
            return;
        };
        let InstructionKind::Assembly { mnemonic, operands } = last.kind else {
            return;
        };
        if !crate::encoding::Mnemonic::same(mnemonic, &mnemonics::JMP) {
            return;
        }
        let operand = operands[0];
        if !operand.is_label() {
            return;
        }
        let StorageKind::Memory {
            location: MemoryLocation::InstructionPointerRelative { label },
        } = operand.kind
        else {
            return;
        };
        if label == self.code_block.end_label {
            self.code_block.instructions.pop();
        }
    }

    /// Finish the body: drop a redundant trailing jump, fix the frame
    /// layout, rewrite every symbolic stack displacement, and freeze.
    pub fn end(&mut self) {
        assert!(!self.frozen, "function ended twice");
        self.remove_unnecessary_jump_to_end();
        frame::resolve_stack_frame(self);
        self.frozen = true;
    }
}
