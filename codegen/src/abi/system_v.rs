//! The System V AMD64 calling convention and its eightbyte classifier.
//!
//! Aggregates are split into aligned 8-byte slots and every slot receives a
//! class; the per-slot classes decide which register file each piece of the
//! argument travels in. The merge and cleanup rules follow the ABI
//! document's wording.

use super::{
    ArgumentPlacement, ArgumentsLayoutItem, FunctionCallJump, FunctionCallSetup,
    CALLING_CONVENTION_X86_64_SYSTEM_V, CALLING_CONVENTION_X86_64_SYSTEM_V_SYSCALL,
};
use crate::context::Compilation;
use crate::descriptor::Descriptor;
use crate::error::{Error, ErrorKind, Result, SourceRange};
use crate::function::FunctionInfo;
use crate::storage::{Bits, Register, Storage, StorageKind, STORAGE_NONE};

const EIGHTBYTE: u32 = 8;
const MAX_EIGHTBYTES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemVClass {
    NoClass,
    Integer,
    Sse,
    SseUp,
    X87,
    X87Up,
    ComplexX87,
    Memory,
}

#[derive(Clone, Copy, Debug)]
pub struct SystemVClassification<'c> {
    pub descriptor: &'c Descriptor<'c>,
    /// The class of the argument as a whole; `Memory` means "on the stack".
    pub class: SystemVClass,
    /// Per-slot classes; only the first `eightbyte_count` entries are
    /// meaningful.
    pub eightbytes: [SystemVClass; MAX_EIGHTBYTES],
    pub eightbyte_count: u32,
}

impl<'c> SystemVClassification<'c> {
    fn memory(descriptor: &'c Descriptor<'c>) -> Self {
        SystemVClassification {
            descriptor,
            class: SystemVClass::Memory,
            eightbytes: [SystemVClass::NoClass; MAX_EIGHTBYTES],
            eightbyte_count: 0,
        }
    }

    fn slots(&self) -> &[SystemVClass] {
        &self.eightbytes[..self.eightbyte_count as usize]
    }

    fn general_register_count(&self) -> u32 {
        self.slots()
            .iter()
            .filter(|class| **class == SystemVClass::Integer)
            .count() as u32
    }

    fn vector_register_count(&self) -> u32 {
        self.slots()
            .iter()
            .filter(|class| **class == SystemVClass::Sse)
            .count() as u32
    }
}

/// One field at a resolved offset inside the aggregate being classified.
struct AggregateField<'c> {
    descriptor: &'c Descriptor<'c>,
    offset: u32,
}

fn aggregate_fields<'c>(descriptor: &'c Descriptor<'c>) -> Vec<AggregateField<'c>> {
    match descriptor {
        Descriptor::Struct(info) => info
            .fields
            .iter()
            .map(|field| AggregateField {
                descriptor: field.descriptor,
                offset: field.offset,
            })
            .collect(),
        Descriptor::FixedSizeArray(info) => (0..info.length as u32)
            .map(|index| AggregateField {
                descriptor: info.item,
                offset: index * info.item.byte_size(),
            })
            .collect(),
        _ => unreachable!("not an aggregate descriptor"),
    }
}

fn has_unaligned(fields: &[AggregateField]) -> bool {
    fields
        .iter()
        .any(|field| field.offset % field.descriptor.byte_alignment().max(1) != 0)
}

fn scalar_class(descriptor: &Descriptor) -> SystemVClass {
    if descriptor.is_float() {
        SystemVClass::Sse
    } else {
        SystemVClass::Integer
    }
}

pub fn classify<'c>(descriptor: &'c Descriptor<'c>) -> SystemVClassification<'c> {
    let byte_size = descriptor.byte_size();
    match descriptor {
        Descriptor::Void
        | Descriptor::Opaque(_)
        | Descriptor::PointerTo(_)
        | Descriptor::FunctionInstance(_) => {
            if byte_size == 0 {
                return SystemVClassification {
                    descriptor,
                    class: SystemVClass::NoClass,
                    eightbytes: [SystemVClass::NoClass; MAX_EIGHTBYTES],
                    eightbyte_count: 0,
                };
            }
            if byte_size <= EIGHTBYTE {
                let class = scalar_class(descriptor);
                let mut eightbytes = [SystemVClass::NoClass; MAX_EIGHTBYTES];
                eightbytes[0] = class;
                return SystemVClassification {
                    descriptor,
                    class,
                    eightbytes,
                    eightbyte_count: 1,
                };
            }
            SystemVClassification::memory(descriptor)
        }
        Descriptor::Struct(_) | Descriptor::FixedSizeArray(_) => {
            let fields = aggregate_fields(descriptor);

            // 1. Larger than eight eightbytes, or any unaligned field:
            // class MEMORY.
            if byte_size > MAX_EIGHTBYTES as u32 * EIGHTBYTE || has_unaligned(&fields) {
                return SystemVClassification::memory(descriptor);
            }

            // 3. Each eightbyte starts as NO_CLASS.
            let eightbyte_count = (byte_size + EIGHTBYTE - 1) / EIGHTBYTE;
            let mut eightbytes = [SystemVClass::NoClass; MAX_EIGHTBYTES];

            // 4. Classify every field recursively, merging per eightbyte.
            classify_fields_recursively(&mut eightbytes, eightbyte_count, &fields, 0);

            // 5. Post-merger cleanup.
            let mut aggregate_class = SystemVClass::NoClass;
            for index in 0..eightbyte_count as usize {
                let preceded_by = if index == 0 {
                    SystemVClass::NoClass
                } else {
                    eightbytes[index - 1]
                };
                let class = eightbytes[index];
                // 5(a) Any MEMORY: the whole argument is passed in memory.
                if class == SystemVClass::Memory {
                    aggregate_class = SystemVClass::Memory;
                    break;
                }
                // 5(b) X87UP not preceded by X87: memory.
                if class == SystemVClass::X87Up && preceded_by != SystemVClass::X87 {
                    aggregate_class = SystemVClass::Memory;
                    break;
                }
                // 5(c) Beyond two eightbytes only SSE followed by SSEUP may
                // stay in registers.
                if byte_size > 2 * EIGHTBYTE {
                    let allowed = if index == 0 {
                        class == SystemVClass::Sse
                    } else {
                        class == SystemVClass::SseUp
                    };
                    if !allowed {
                        aggregate_class = SystemVClass::Memory;
                        break;
                    }
                }
                // 5(d) Orphan SSEUP converts to SSE.
                if class == SystemVClass::SseUp
                    && !(preceded_by == SystemVClass::Sse || preceded_by == SystemVClass::SseUp)
                {
                    eightbytes[index] = SystemVClass::Sse;
                }
            }

            if aggregate_class == SystemVClass::Memory {
                return SystemVClassification::memory(descriptor);
            }

            SystemVClassification {
                descriptor,
                class: eightbytes[0],
                eightbytes,
                eightbyte_count,
            }
        }
    }
}

fn classify_fields_recursively(
    eightbytes: &mut [SystemVClass; MAX_EIGHTBYTES],
    eightbyte_count: u32,
    fields: &[AggregateField],
    parent_offset: u32,
) {
    for field in fields {
        let field_offset = parent_offset + field.offset;
        match field.descriptor {
            Descriptor::Struct(_) | Descriptor::FixedSizeArray(_) => {
                let nested = aggregate_fields(field.descriptor);
                classify_fields_recursively(eightbytes, eightbyte_count, &nested, field_offset);
            }
            scalar => {
                let byte_size = scalar.byte_size();
                if byte_size == 0 {
                    continue;
                }
                let start_index = field_offset / EIGHTBYTE;
                let end_index = (field_offset + byte_size - 1) / EIGHTBYTE;
                // A scalar field never crosses an eightbyte boundary: no
                // scalar is wider than eight bytes and unaligned fields were
                // already sent to memory.
                assert_eq!(start_index, end_index);
                assert!(start_index < eightbyte_count);

                let field_class = if byte_size <= EIGHTBYTE {
                    scalar_class(scalar)
                } else {
                    SystemVClass::Memory
                };
                let slot = &mut eightbytes[start_index as usize];
                *slot = merge_classes(*slot, field_class);
            }
        }
    }
}

/// The per-eightbyte merge rule for two classes meeting in one slot.
fn merge_classes(a: SystemVClass, b: SystemVClass) -> SystemVClass {
    use SystemVClass::*;
    // 4(a) Both equal: that class.
    if a == b {
        return a;
    }
    // 4(b) One NO_CLASS: the other.
    if a == NoClass {
        return b;
    }
    if b == NoClass {
        return a;
    }
    // 4(c) Any MEMORY: MEMORY.
    if a == Memory || b == Memory {
        return Memory;
    }
    // 4(d) Any INTEGER: INTEGER.
    if a == Integer || b == Integer {
        return Integer;
    }
    // 4(e) Any X87-family class: MEMORY.
    if matches!(a, X87 | X87Up | ComplexX87) || matches!(b, X87 | X87Up | ComplexX87) {
        return Memory;
    }
    // 4(f) Otherwise SSE.
    Sse
}

struct RegisterPool {
    items: &'static [Register],
    index: usize,
}

impl RegisterPool {
    fn new(items: &'static [Register]) -> Self {
        RegisterPool { items, index: 0 }
    }

    fn remaining(&self) -> u32 {
        (self.items.len() - self.index) as u32
    }

    fn take(&mut self) -> Register {
        let register = self.items[self.index];
        self.index += 1;
        register
    }
}

struct RegisterState {
    general: RegisterPool,
    vector: RegisterPool,
}

/// Reclassify to MEMORY when the required registers are exhausted.
fn adjust_classification_if_no_register_available<'c>(
    registers: &RegisterState,
    classification: &mut SystemVClassification<'c>,
) {
    if classification.class == SystemVClass::Memory {
        return;
    }
    if classification.general_register_count() > registers.general.remaining()
        || classification.vector_register_count() > registers.vector.remaining()
    {
        *classification = SystemVClassification::memory(classification.descriptor);
    }
}

/// Turn a classification into a concrete argument placement, consuming
/// registers or stack space.
fn placement_for_classification<'c>(
    registers: &mut RegisterState,
    classification: &SystemVClassification<'c>,
    stack_offset: &mut u32,
    source_range: SourceRange,
) -> Result<ArgumentPlacement<'c>> {
    let descriptor = classification.descriptor;
    let bit_size = descriptor.bit_size();
    match classification.class {
        SystemVClass::NoClass => Ok(ArgumentPlacement::Absolute(STORAGE_NONE)),
        SystemVClass::Memory => {
            let alignment = descriptor.byte_alignment().max(8);
            *stack_offset = stack_offset.next_multiple_of(alignment);
            let offset = *stack_offset as i32;
            *stack_offset += descriptor.byte_size();
            Ok(ArgumentPlacement::BaseRelative { offset })
        }
        _ => match classification.slots() {
            [SystemVClass::Integer] => Ok(ArgumentPlacement::Absolute(Storage::register(
                registers.general.take(),
                bit_size,
            ))),
            [SystemVClass::Sse] => Ok(ArgumentPlacement::Absolute(Storage::register(
                registers.vector.take(),
                bit_size,
            ))),
            [first, second] => {
                let mut take = |class: &SystemVClass| -> Result<Register> {
                    match class {
                        // A padding-only eightbyte still occupies a slot.
                        SystemVClass::Integer | SystemVClass::NoClass => {
                            Ok(registers.general.take())
                        }
                        SystemVClass::Sse => Ok(registers.vector.take()),
                        other => Err(Error::new(
                            ErrorKind::Unimplemented(format!(
                                "eightbyte class {:?} in a register argument",
                                other
                            )),
                            source_range,
                        )),
                    }
                };
                let registers = [take(first)?, take(second)?];
                Ok(ArgumentPlacement::Absolute(Storage {
                    bit_size,
                    kind: StorageKind::Unpacked { registers },
                }))
            }
            slots => Err(Error::new(
                ErrorKind::Unimplemented(format!(
                    "{}-eightbyte register argument",
                    slots.len()
                )),
                source_range,
            )),
        },
    }
}

const ARGUMENT_GENERAL_REGISTERS: [Register; 6] = [
    Register::Di,
    Register::Si,
    Register::D,
    Register::C,
    Register::R8,
    Register::R9,
];
const ARGUMENT_VECTOR_REGISTERS: [Register; 8] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
];
const RETURN_GENERAL_REGISTERS: [Register; 2] = [Register::A, Register::D];
const RETURN_VECTOR_REGISTERS: [Register; 2] = [Register::Xmm0, Register::Xmm1];

pub(super) fn call_setup<'c>(
    _compilation: &'c Compilation,
    function: &'c FunctionInfo<'c>,
) -> Result<FunctionCallSetup<'c>> {
    let source_range = SourceRange::default();

    let mut is_indirect_return = false;
    let (caller_return, callee_return) = match function.returns {
        Descriptor::Void => (STORAGE_NONE, STORAGE_NONE),
        returns => {
            let classification = classify(returns);
            if classification.class == SystemVClass::Memory {
                // The caller passes the result address in DI; it comes back
                // in A.
                is_indirect_return = true;
                (
                    Storage::indirect(returns.bit_size(), Register::A),
                    Storage::indirect(returns.bit_size(), Register::Di),
                )
            } else {
                let mut registers = RegisterState {
                    general: RegisterPool::new(&RETURN_GENERAL_REGISTERS),
                    vector: RegisterPool::new(&RETURN_VECTOR_REGISTERS),
                };
                let mut stack_offset = 0;
                let placement = placement_for_classification(
                    &mut registers,
                    &classification,
                    &mut stack_offset,
                    source_range,
                )?;
                let ArgumentPlacement::Absolute(storage) = placement else {
                    unreachable!("register return classified to the stack");
                };
                (storage, storage)
            }
        }
    };

    let mut registers = RegisterState {
        general: RegisterPool::new(&ARGUMENT_GENERAL_REGISTERS),
        vector: RegisterPool::new(&ARGUMENT_VECTOR_REGISTERS),
    };
    if is_indirect_return {
        // DI is consumed by the hidden result pointer.
        registers.general.take();
    }

    let mut arguments_layout = Vec::with_capacity(function.parameters.len() + 1);
    let mut stack_offset: u32 = 0;
    for parameter in &function.parameters {
        let mut classification = classify(parameter.descriptor);
        adjust_classification_if_no_register_available(&registers, &mut classification);
        let placement = placement_for_classification(
            &mut registers,
            &classification,
            &mut stack_offset,
            parameter.source_range,
        )?;
        arguments_layout.push(ArgumentsLayoutItem {
            name: parameter.name,
            descriptor: parameter.descriptor,
            placement,
        });
    }
    let parameters_stack_size = stack_offset.next_multiple_of(8);

    if is_indirect_return {
        arguments_layout.push(ArgumentsLayoutItem {
            name: "",
            descriptor: function.returns,
            placement: ArgumentPlacement::Absolute(Storage::indirect(
                function.returns.bit_size(),
                Register::Di,
            )),
        });
    }

    Ok(FunctionCallSetup {
        jump: FunctionCallJump::Call,
        calling_convention: &CALLING_CONVENTION_X86_64_SYSTEM_V,
        caller_return,
        callee_return,
        arguments_layout,
        parameters_stack_size,
    })
}

const SYSCALL_GENERAL_REGISTERS: [Register; 6] = [
    Register::Di,
    Register::Si,
    Register::D,
    Register::R10,
    Register::R8,
    Register::R9,
];

pub(super) fn syscall_setup<'c>(
    _compilation: &'c Compilation,
    function: &'c FunctionInfo<'c>,
) -> Result<FunctionCallSetup<'c>> {
    let source_range = SourceRange::default();

    let (caller_return, callee_return) = match function.returns {
        Descriptor::Void => (STORAGE_NONE, STORAGE_NONE),
        returns => {
            if returns.bit_size() != Bits(32) {
                return Err(Error::new(
                    ErrorKind::Unimplemented(
                        "syscall return values are 32-bit integers".to_string(),
                    ),
                    source_range,
                ));
            }
            let storage = Storage::register(Register::A, Bits(32));
            (storage, storage)
        }
    };

    let mut registers = RegisterState {
        general: RegisterPool::new(&SYSCALL_GENERAL_REGISTERS),
        vector: RegisterPool::new(&[]),
    };

    let mut arguments_layout = Vec::with_capacity(function.parameters.len());
    for parameter in &function.parameters {
        let classification = classify(parameter.descriptor);
        // Only INTEGER-class values reach the kernel; nothing is passed on
        // the stack.
        if classification.class != SystemVClass::Integer
            || classification.vector_register_count() != 0
        {
            return Err(Error::new(
                ErrorKind::Unimplemented(format!(
                    "{:?}-class syscall argument {}",
                    classification.class, parameter.name
                )),
                parameter.source_range,
            ));
        }
        if classification.general_register_count() > registers.general.remaining() {
            return Err(Error::new(
                ErrorKind::Unimplemented(
                    "syscalls take no more than six argument eightbytes".to_string(),
                ),
                parameter.source_range,
            ));
        }
        let mut stack_offset = 0;
        let placement = placement_for_classification(
            &mut registers,
            &classification,
            &mut stack_offset,
            parameter.source_range,
        )?;
        assert_eq!(stack_offset, 0);
        arguments_layout.push(ArgumentsLayoutItem {
            name: parameter.name,
            descriptor: parameter.descriptor,
            placement,
        });
    }

    Ok(FunctionCallSetup {
        jump: FunctionCallJump::Syscall,
        calling_convention: &CALLING_CONVENTION_X86_64_SYSTEM_V_SYSCALL,
        caller_return,
        callee_return,
        arguments_layout,
        parameters_stack_size: 0,
    })
}
