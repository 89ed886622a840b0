//! Operand storage model.
//!
//! A [`Storage`] describes where a value lives while code for it is being
//! generated: a general-purpose or SSE register, a static (immediate)
//! bit pattern, a memory location, the EFLAGS register after a comparison,
//! or a pair of registers for a 16-byte aggregate. Every storage carries its
//! width in bits; equality is structural and includes the width.

use crate::descriptor::Descriptor;
use crate::program::Label;

/// An x86-64 register.
///
/// The 16 general-purpose registers are numbered 0-15 so that the low three
/// bits are the ModR/M `reg`/`r/m` field and bit 3 drives the REX.{R,X,B}
/// extension bits. The 16 SSE registers occupy a disjoint numeric range
/// above them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    A = 0b0000,
    C = 0b0001,
    D = 0b0010,
    B = 0b0011,
    Sp = 0b0100,
    Bp = 0b0101,
    Si = 0b0110,
    Di = 0b0111,
    R8 = 0b1000,
    R9 = 0b1001,
    R10 = 0b1010,
    R11 = 0b1011,
    R12 = 0b1100,
    R13 = 0b1101,
    R14 = 0b1110,
    R15 = 0b1111,

    Xmm0 = 0b10000,
    Xmm1 = 0b10001,
    Xmm2 = 0b10010,
    Xmm3 = 0b10011,
    Xmm4 = 0b10100,
    Xmm5 = 0b10101,
    Xmm6 = 0b10110,
    Xmm7 = 0b10111,
    Xmm8 = 0b11000,
    Xmm9 = 0b11001,
    Xmm10 = 0b11010,
    Xmm11 = 0b11011,
    Xmm12 = 0b11100,
    Xmm13 = 0b11101,
    Xmm14 = 0b11110,
    Xmm15 = 0b11111,
}

/// All general-purpose registers in encoding order.
pub const GENERAL_PURPOSE_REGISTERS: [Register; 16] = [
    Register::A,
    Register::C,
    Register::D,
    Register::B,
    Register::Sp,
    Register::Bp,
    Register::Si,
    Register::Di,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

impl Register {
    /// The register's hardware encoding: the ModR/M / SIB field value
    /// including the extension bit.
    #[inline]
    pub fn hw_index(self) -> u8 {
        self as u8 & 0b1111
    }

    /// True for the SSE register range.
    #[inline]
    pub fn is_xmm(self) -> bool {
        self as u8 & 0b10000 != 0
    }

    /// Index into a 32-entry register bitset.
    #[inline]
    pub fn bit(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        use Register::*;
        let name = match self {
            A => "rax",
            C => "rcx",
            D => "rdx",
            B => "rbx",
            Sp => "rsp",
            Bp => "rbp",
            Si => "rsi",
            Di => "rdi",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
            Xmm0 => "xmm0",
            Xmm1 => "xmm1",
            Xmm2 => "xmm2",
            Xmm3 => "xmm3",
            Xmm4 => "xmm4",
            Xmm5 => "xmm5",
            Xmm6 => "xmm6",
            Xmm7 => "xmm7",
            Xmm8 => "xmm8",
            Xmm9 => "xmm9",
            Xmm10 => "xmm10",
            Xmm11 => "xmm11",
            Xmm12 => "xmm12",
            Xmm13 => "xmm13",
            Xmm14 => "xmm14",
            Xmm15 => "xmm15",
        };
        f.write_str(name)
    }
}

/// A width carried as a bit count; the byte size is `ceil(bits / 8)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bits(pub u32);

impl Bits {
    #[inline]
    pub const fn byte_size(self) -> u32 {
        (self.0 + 7) / 8
    }
}

/// The comparison a conditional jump or `setcc` acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareType {
    Equal,
    NotEqual,
    UnsignedBelow,
    UnsignedBelowEqual,
    UnsignedAbove,
    UnsignedAboveEqual,
    SignedLess,
    SignedLessEqual,
    SignedGreater,
    SignedGreaterEqual,
}

impl CompareType {
    /// The logical negation, used when branching over a block.
    pub fn negate(self) -> Self {
        use CompareType::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            UnsignedBelow => UnsignedAboveEqual,
            UnsignedBelowEqual => UnsignedAbove,
            UnsignedAbove => UnsignedBelowEqual,
            UnsignedAboveEqual => UnsignedBelow,
            SignedLess => SignedGreaterEqual,
            SignedLessEqual => SignedGreater,
            SignedGreater => SignedLessEqual,
            SignedGreaterEqual => SignedLess,
        }
    }
}

/// Which part of the frame a symbolic `[rsp + offset]` reference points at.
///
/// For every area except `Absolute` the stored offset is symbolic and is
/// rewritten by the stack resolver once the final frame size is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackArea {
    /// A local variable; the symbolic offset is negative.
    Local,
    /// An argument received from the caller; the symbolic offset is the
    /// non-negative offset within the incoming argument area.
    ReceivedArgument,
    /// An outgoing argument for a call made by this function; the offset is
    /// already relative to RSP at the call site.
    CallTargetArgument,
    /// A concrete offset that needs no rewriting.
    Absolute,
}

/// Where a [`Storage::Memory`] operand points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// RIP-relative access to a labelled location; encoded as a 32-bit
    /// displacement patched at link time.
    InstructionPointerRelative { label: Label },
    /// `[base + index + offset]`. The base register must be general-purpose;
    /// scales other than 1 are not supported.
    Indirect {
        base: Register,
        index: Option<Register>,
        offset: i32,
        area: StackArea,
    },
}

/// A static bit pattern. Values of eight bytes or less are stored inline
/// to avoid allocation; larger blobs reference memory owned by the
/// compilation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticMemory<'c> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Heap(&'c [u8]),
}

impl<'c> StaticMemory<'c> {
    pub fn byte_size(&self) -> u32 {
        match self {
            StaticMemory::U8(_) => 1,
            StaticMemory::U16(_) => 2,
            StaticMemory::U32(_) => 4,
            StaticMemory::U64(_) => 8,
            StaticMemory::Heap(bytes) => bytes.len() as u32,
        }
    }
}

/// The variants of [`Storage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind<'c> {
    /// No storage; the value of `void`.
    None,
    /// A placeholder the code generator is free to decide.
    Any,
    /// The result of a comparison, still in the flags register.
    Eflags { compare_type: CompareType },
    /// A general-purpose register.
    Register { index: Register },
    /// An SSE register.
    Xmm { index: Register },
    /// A static bit pattern (an immediate, or arena-resident constant data).
    Static { memory: StaticMemory<'c> },
    /// A memory location.
    Memory { location: MemoryLocation },
    /// A 16-byte aggregate split over two registers.
    Unpacked { registers: [Register; 2] },
}

/// An operand: a [`StorageKind`] plus the operand width in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Storage<'c> {
    pub bit_size: Bits,
    pub kind: StorageKind<'c>,
}

pub const STORAGE_NONE: Storage<'static> = Storage {
    bit_size: Bits(0),
    kind: StorageKind::None,
};

impl<'c> Storage<'c> {
    pub fn none() -> Self {
        STORAGE_NONE
    }

    /// Register storage of the given width; picks the GPR or XMM variant
    /// from the register's class.
    pub fn register(index: Register, bit_size: Bits) -> Self {
        let kind = if index.is_xmm() {
            StorageKind::Xmm { index }
        } else {
            debug_assert!(bit_size.byte_size() <= 8);
            StorageKind::Register { index }
        };
        Storage { bit_size, kind }
    }

    pub fn register_for_descriptor(index: Register, descriptor: &Descriptor) -> Self {
        Self::register(index, descriptor.bit_size())
    }

    pub fn eflags(compare_type: CompareType) -> Self {
        Storage {
            bit_size: Bits(0),
            kind: StorageKind::Eflags { compare_type },
        }
    }

    /// `[base]` with no displacement, e.g. a hidden-pointer argument.
    pub fn indirect(bit_size: Bits, base: Register) -> Self {
        debug_assert!(!base.is_xmm());
        Storage {
            bit_size,
            kind: StorageKind::Memory {
                location: MemoryLocation::Indirect {
                    base,
                    index: None,
                    offset: 0,
                    area: StackArea::Absolute,
                },
            },
        }
    }

    /// A symbolic `[rsp + offset]` reference into the given stack area.
    pub fn stack(area: StackArea, offset: i32, bit_size: Bits) -> Self {
        Storage {
            bit_size,
            kind: StorageKind::Memory {
                location: MemoryLocation::Indirect {
                    base: Register::Sp,
                    index: None,
                    offset,
                    area,
                },
            },
        }
    }

    /// RIP-relative reference to a label, e.g. static data or an IAT slot.
    pub fn rip_relative(label: Label, bit_size: Bits) -> Self {
        Storage {
            bit_size,
            kind: StorageKind::Memory {
                location: MemoryLocation::InstructionPointerRelative { label },
            },
        }
    }

    /// A 32-bit label reference used as a jump or call target.
    pub fn code_label32(label: Label) -> Self {
        Self::rip_relative(label, Bits(32))
    }

    pub fn immediate_u8(value: u8) -> Self {
        Storage {
            bit_size: Bits(8),
            kind: StorageKind::Static {
                memory: StaticMemory::U8(value),
            },
        }
    }

    pub fn immediate_u16(value: u16) -> Self {
        Storage {
            bit_size: Bits(16),
            kind: StorageKind::Static {
                memory: StaticMemory::U16(value),
            },
        }
    }

    pub fn immediate_u32(value: u32) -> Self {
        Storage {
            bit_size: Bits(32),
            kind: StorageKind::Static {
                memory: StaticMemory::U32(value),
            },
        }
    }

    pub fn immediate_u64(value: u64) -> Self {
        Storage {
            bit_size: Bits(64),
            kind: StorageKind::Static {
                memory: StaticMemory::U64(value),
            },
        }
    }

    pub fn immediate_s8(value: i8) -> Self {
        Self::immediate_u8(value as u8)
    }

    pub fn immediate_s16(value: i16) -> Self {
        Self::immediate_u16(value as u16)
    }

    pub fn immediate_s32(value: i32) -> Self {
        Self::immediate_u32(value as u32)
    }

    pub fn immediate_s64(value: i64) -> Self {
        Self::immediate_u64(value as u64)
    }

    /// Frame-size immediate: the imm8 form when the value fits a signed
    /// byte, otherwise imm32.
    pub fn immediate_auto_8_or_32(value: i32) -> Self {
        if let Ok(v) = i8::try_from(value) {
            Self::immediate_s8(v)
        } else {
            Self::immediate_s32(value)
        }
    }

    pub fn byte_size(&self) -> u32 {
        self.bit_size.byte_size()
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, StorageKind::None)
    }

    /// True for a 32-bit instruction-pointer-relative reference, the shape a
    /// jump/call target label takes.
    pub fn is_label(&self) -> bool {
        matches!(
            self.kind,
            StorageKind::Memory {
                location: MemoryLocation::InstructionPointerRelative { .. }
            }
        ) && self.bit_size == Bits(32)
    }

    pub fn is_register_or_memory(&self) -> bool {
        matches!(
            self.kind,
            StorageKind::Register { .. } | StorageKind::Xmm { .. } | StorageKind::Memory { .. }
        )
    }

    /// True for an inline static value usable as an instruction immediate.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self.kind,
            StorageKind::Static {
                memory: StaticMemory::U8(_)
                    | StaticMemory::U16(_)
                    | StaticMemory::U32(_)
                    | StaticMemory::U64(_)
            }
        )
    }

    pub fn is_register_index(&self, reg: Register) -> bool {
        match self.kind {
            StorageKind::Register { index } | StorageKind::Xmm { index } => index == reg,
            _ => false,
        }
    }

    /// Sign-extending read of a 1/2/4/8-byte immediate. No other sizes are
    /// accepted.
    pub fn immediate_value_up_to_s64(&self) -> i64 {
        match self.kind {
            StorageKind::Static { memory } => match memory {
                StaticMemory::U8(v) => v as i8 as i64,
                StaticMemory::U16(v) => v as i16 as i64,
                StaticMemory::U32(v) => v as i32 as i64,
                StaticMemory::U64(v) => v as i64,
                StaticMemory::Heap(_) => panic!("expected an inline immediate"),
            },
            _ => panic!("expected an immediate storage"),
        }
    }

    /// Zero-extending read of a 1/2/4/8-byte immediate.
    pub fn immediate_value_up_to_u64(&self) -> u64 {
        match self.kind {
            StorageKind::Static { memory } => match memory {
                StaticMemory::U8(v) => v as u64,
                StaticMemory::U16(v) => v as u64,
                StaticMemory::U32(v) => v as u64,
                StaticMemory::U64(v) => v,
                StaticMemory::Heap(_) => panic!("expected an inline immediate"),
            },
            _ => panic!("expected an immediate storage"),
        }
    }

    /// The immediate's bytes in encoding (little-endian) order.
    pub fn immediate_bytes(&self) -> smallvec::SmallVec<[u8; 8]> {
        let value = self.immediate_value_up_to_u64();
        let size = self.byte_size() as usize;
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        smallvec::SmallVec::from_slice(&value.to_le_bytes()[..size])
    }
}
