//! The compilation context.
//!
//! A [`Compilation`] owns the bump arena that descriptors, interned strings
//! and constant data are allocated from. Everything handed out borrows from
//! the context, so the borrow checker enforces the single lifetime rule:
//! valid exactly as long as the compilation.

use bumpalo::Bump;

use crate::descriptor::{Descriptor, FixedSizeArrayInfo, StructField, StructInfo};
use crate::storage::Bits;

#[derive(Default)]
pub struct Compilation {
    arena: Bump,
}

impl Compilation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_descriptor<'c>(&'c self, descriptor: Descriptor<'c>) -> &'c Descriptor<'c> {
        self.arena.alloc(descriptor)
    }

    pub fn alloc_str<'c>(&'c self, s: &str) -> &'c str {
        self.arena.alloc_str(s)
    }

    pub fn alloc_bytes<'c>(&'c self, bytes: &[u8]) -> &'c [u8] {
        self.arena.alloc_slice_copy(bytes)
    }

    pub fn descriptor_pointer_to<'c>(
        &'c self,
        pointee: &'c Descriptor<'c>,
    ) -> &'c Descriptor<'c> {
        self.arena.alloc(Descriptor::PointerTo(pointee))
    }

    pub fn descriptor_array_of<'c>(
        &'c self,
        item: &'c Descriptor<'c>,
        length: u64,
    ) -> &'c Descriptor<'c> {
        self.arena
            .alloc(Descriptor::FixedSizeArray(FixedSizeArrayInfo { item, length }))
    }

    /// Build a struct descriptor with a C-style layout: each field at the
    /// next offset aligned for it, total size rounded up to the largest
    /// field alignment.
    pub fn descriptor_struct<'c>(
        &'c self,
        fields: &[(&str, &'c Descriptor<'c>)],
    ) -> &'c Descriptor<'c> {
        let mut offset = 0u32;
        let mut alignment = 1u32;
        let mut laid_out = Vec::with_capacity(fields.len());
        for (name, descriptor) in fields {
            let field_alignment = descriptor.byte_alignment().max(1);
            alignment = alignment.max(field_alignment);
            offset = align_up(offset, field_alignment);
            laid_out.push(StructField {
                name: self.alloc_str(name),
                descriptor,
                offset,
            });
            offset += descriptor.byte_size();
        }
        let size = align_up(offset, alignment);
        let fields = self.arena.alloc_slice_copy(&laid_out);
        self.arena.alloc(Descriptor::Struct(StructInfo {
            fields,
            bit_size: Bits(size * 8),
            bit_alignment: Bits(alignment * 8),
        }))
    }
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor;

    #[test]
    fn struct_layout() {
        let compilation = Compilation::new();
        let pair = compilation.descriptor_struct(&[
            ("x", &descriptor::S8),
            ("y", &descriptor::S64),
        ]);
        match pair {
            Descriptor::Struct(info) => {
                assert_eq!(info.fields[0].offset, 0);
                assert_eq!(info.fields[1].offset, 8);
            }
            _ => unreachable!(),
        }
        assert_eq!(pair.byte_size(), 16);
        assert_eq!(pair.byte_alignment(), 8);
    }
}
