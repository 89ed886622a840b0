//! Type descriptors.
//!
//! The front end hands the backend fully elaborated types: opaque scalars
//! with a size and alignment, pointers, fixed-size arrays, structs with a
//! resolved memory layout, and function instances. Descriptors are
//! allocated from the [`Compilation`](crate::Compilation) arena and live
//! exactly as long as it does.

use crate::abi::FunctionCallSetup;
use crate::storage::Bits;

/// Scalar interpretation of an opaque descriptor; drives calling-convention
/// classification (SSE vs. general-purpose).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarClass {
    Integer,
    Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpaqueInfo {
    pub bit_size: Bits,
    pub bit_alignment: Bits,
    pub class: ScalarClass,
}

/// One field of a struct layout, at a resolved byte offset from the start
/// of the aggregate.
#[derive(Clone, Copy, Debug)]
pub struct StructField<'c> {
    pub name: &'c str,
    pub descriptor: &'c Descriptor<'c>,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct StructInfo<'c> {
    pub fields: &'c [StructField<'c>],
    pub bit_size: Bits,
    pub bit_alignment: Bits,
}

#[derive(Clone, Copy, Debug)]
pub struct FixedSizeArrayInfo<'c> {
    pub item: &'c Descriptor<'c>,
    pub length: u64,
}

/// A fully elaborated type, as seen by the backend.
#[derive(Clone, Copy, Debug)]
pub enum Descriptor<'c> {
    Void,
    Opaque(OpaqueInfo),
    PointerTo(&'c Descriptor<'c>),
    FixedSizeArray(FixedSizeArrayInfo<'c>),
    Struct(StructInfo<'c>),
    /// A function whose call setup has been computed; used for calls through
    /// pointers and for import thunks.
    FunctionInstance(&'c FunctionCallSetup<'c>),
}

impl<'c> Descriptor<'c> {
    pub fn bit_size(&self) -> Bits {
        match self {
            Descriptor::Void => Bits(0),
            Descriptor::Opaque(info) => info.bit_size,
            Descriptor::PointerTo(_) | Descriptor::FunctionInstance(_) => Bits(64),
            Descriptor::FixedSizeArray(info) => {
                Bits(info.item.bit_size().0 * info.length as u32)
            }
            Descriptor::Struct(info) => info.bit_size,
        }
    }

    pub fn byte_size(&self) -> u32 {
        self.bit_size().byte_size()
    }

    pub fn bit_alignment(&self) -> Bits {
        match self {
            Descriptor::Void => Bits(0),
            Descriptor::Opaque(info) => info.bit_alignment,
            Descriptor::PointerTo(_) | Descriptor::FunctionInstance(_) => Bits(64),
            Descriptor::FixedSizeArray(info) => info.item.bit_alignment(),
            Descriptor::Struct(info) => info.bit_alignment,
        }
    }

    pub fn byte_alignment(&self) -> u32 {
        self.bit_alignment().byte_size()
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            Descriptor::Opaque(OpaqueInfo {
                class: ScalarClass::Float,
                ..
            })
        )
    }
}

const fn opaque(bits: u32, class: ScalarClass) -> Descriptor<'static> {
    Descriptor::Opaque(OpaqueInfo {
        bit_size: Bits(bits),
        bit_alignment: Bits(bits),
        class,
    })
}

pub static VOID: Descriptor<'static> = Descriptor::Void;
pub static S8: Descriptor<'static> = opaque(8, ScalarClass::Integer);
pub static S16: Descriptor<'static> = opaque(16, ScalarClass::Integer);
pub static S32: Descriptor<'static> = opaque(32, ScalarClass::Integer);
pub static S64: Descriptor<'static> = opaque(64, ScalarClass::Integer);
pub static U8: Descriptor<'static> = opaque(8, ScalarClass::Integer);
pub static U16: Descriptor<'static> = opaque(16, ScalarClass::Integer);
pub static U32: Descriptor<'static> = opaque(32, ScalarClass::Integer);
pub static U64: Descriptor<'static> = opaque(64, ScalarClass::Integer);
pub static F32: Descriptor<'static> = opaque(32, ScalarClass::Float);
pub static F64: Descriptor<'static> = opaque(64, ScalarClass::Float);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sizes() {
        assert_eq!(S64.byte_size(), 8);
        assert_eq!(S64.byte_alignment(), 8);
        assert_eq!(U16.byte_size(), 2);
        assert!(F32.is_float());
        assert!(!S32.is_float());
    }

    #[test]
    fn aggregate_sizes() {
        let array = Descriptor::FixedSizeArray(FixedSizeArrayInfo {
            item: &S32,
            length: 4,
        });
        assert_eq!(array.byte_size(), 16);
        assert_eq!(array.byte_alignment(), 4);

        let pointer = Descriptor::PointerTo(&array);
        assert_eq!(pointer.byte_size(), 8);
    }
}
