//! The program being linked: sections, labels, patches and imports.
//!
//! Labels and patch sites are `{section, offset}` pairs resolved on read;
//! nothing holds a pointer into a section buffer, so buffers are free to
//! grow while code is emitted.

use cranelift_entity::{entity_impl, PrimaryMap};
use log::debug;

use crate::abi::CallingConvention;
use crate::builder::FunctionBuilder;
use crate::error::{Error, ErrorKind, Result, SourceRange};
use crate::function::FunctionInfo;
use crate::storage::{Bits, Storage};

bitflags::bitflags! {
    /// Memory permissions of a section once the image is mapped.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SectionPermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// An opaque reference to a [`Section`] owned by a [`Program`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);
entity_impl!(SectionId, "section");

/// An opaque reference to a label owned by a [`Program`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");

pub struct Section {
    pub name: &'static str,
    pub buffer: Vec<u8>,
    /// Image-relative address of the section start; assigned by the image
    /// writer (or the JIT) before labels are patched.
    pub base_rva: u32,
    pub permissions: SectionPermissions,
}

impl Section {
    pub fn current_offset(&self) -> u32 {
        self.buffer.len() as u32
    }
}

/// A position in a section. Created unresolved; resolved exactly once when
/// its definition is emitted.
#[derive(Clone, Debug)]
pub struct LabelData<'c> {
    pub name: &'c str,
    pub resolved: bool,
    pub section: SectionId,
    pub offset_in_section: u32,
}

/// A 32-bit slot at `patch_at` that receives `rva(target) - rva(from)` once
/// every label is resolved.
#[derive(Clone, Copy, Debug)]
pub struct LabelDiffPatch {
    pub target: Label,
    pub from: LabelLocation,
    pub patch_at: LabelLocation,
}

#[derive(Clone, Copy, Debug)]
pub struct LabelLocation {
    pub section: SectionId,
    pub offset: u32,
}

/// One symbol imported from a dynamic library; `label` marks its IAT slot
/// in the data section.
#[derive(Clone, Debug)]
pub struct ImportSymbol<'c> {
    pub name: &'c str,
    pub label: Label,
}

#[derive(Clone, Debug)]
pub struct ImportLibrary<'c> {
    pub name: &'c str,
    pub symbols: Vec<ImportSymbol<'c>>,
}

pub struct Program<'c> {
    pub sections: PrimaryMap<SectionId, Section>,
    pub code_section: SectionId,
    pub data_section: SectionId,
    pub labels: PrimaryMap<Label, LabelData<'c>>,
    pub patches: Vec<LabelDiffPatch>,
    pub import_libraries: Vec<ImportLibrary<'c>>,
    pub functions: Vec<FunctionBuilder<'c>>,
    pub entry_point: Option<&'c FunctionInfo<'c>>,
    pub default_calling_convention: &'static CallingConvention,
}

impl<'c> Program<'c> {
    pub fn new(default_calling_convention: &'static CallingConvention) -> Self {
        let mut sections = PrimaryMap::new();
        let data_section = sections.push(Section {
            name: ".rdata",
            buffer: Vec::new(),
            base_rva: 0,
            permissions: SectionPermissions::READ,
        });
        let code_section = sections.push(Section {
            name: ".text",
            buffer: Vec::new(),
            base_rva: 0,
            permissions: SectionPermissions::READ | SectionPermissions::EXECUTE,
        });
        Program {
            sections,
            code_section,
            data_section,
            labels: PrimaryMap::new(),
            patches: Vec::new(),
            import_libraries: Vec::new(),
            functions: Vec::new(),
            entry_point: None,
            default_calling_convention,
        }
    }

    /// Create an unresolved label bound to `section`.
    pub fn make_label(&mut self, section: SectionId, name: &'c str) -> Label {
        self.labels.push(LabelData {
            name,
            resolved: false,
            section,
            offset_in_section: 0,
        })
    }

    /// Resolve a label to a section-relative offset. Resolving twice to the
    /// same offset is permitted; to a different offset is a bug.
    pub fn set_label_offset(&mut self, label: Label, offset_in_section: u32) {
        let data = &mut self.labels[label];
        if data.resolved {
            assert_eq!(
                data.offset_in_section, offset_in_section,
                "label {} resolved twice to different offsets",
                label
            );
            return;
        }
        data.resolved = true;
        data.offset_in_section = offset_in_section;
    }

    pub fn resolve_label_to_rva(&self, label: Label) -> u32 {
        let data = &self.labels[label];
        assert!(data.resolved, "label {} used before it was resolved", label);
        self.sections[data.section].base_rva + data.offset_in_section
    }

    pub fn record_patch(&mut self, patch: LabelDiffPatch) {
        self.patches.push(patch);
    }

    /// Write every recorded `rva(target) - rva(from)` difference into its
    /// 32-bit slot. Each patch writes a distinct slot, so application order
    /// does not matter.
    pub fn patch_labels(&mut self) -> Result<()> {
        debug!("patching {} label slots", self.patches.len());
        for patch in core::mem::take(&mut self.patches) {
            let target_rva = self.resolve_label_to_rva(patch.target) as i64;
            let from_rva =
                (self.sections[patch.from.section].base_rva + patch.from.offset) as i64;
            let diff = target_rva - from_rva;
            let diff = i32::try_from(diff).map_err(|_| {
                Error::new(ErrorKind::DisplacementOutOfRange, SourceRange::default())
            })?;
            let buffer = &mut self.sections[patch.patch_at.section].buffer;
            let at = patch.patch_at.offset as usize;
            let slot: &mut [u8; 4] = (&mut buffer[at..at + 4]).try_into().unwrap();
            let existing = i32::from_le_bytes(*slot);
            *slot = (existing + diff).to_le_bytes();
        }
        Ok(())
    }

    /// Append constant bytes to the data section and return a resolved label
    /// for them.
    pub fn append_data(&mut self, name: &'c str, bytes: &[u8], alignment: u32) -> Label {
        let section = self.data_section;
        let buffer = &mut self.sections[section].buffer;
        let alignment = alignment.max(1) as usize;
        let padding = buffer.len().next_multiple_of(alignment) - buffer.len();
        buffer.extend(core::iter::repeat(0).take(padding));
        let offset = buffer.len() as u32;
        buffer.extend_from_slice(bytes);
        let label = self.make_label(section, name);
        self.set_label_offset(label, offset);
        label
    }

    /// The storage for an imported symbol: an 8-byte RIP-relative read of
    /// its IAT slot. Library names compare case-insensitively; repeated
    /// imports of the same symbol share one slot.
    pub fn import_symbol(&mut self, library_name: &'c str, symbol_name: &'c str) -> Storage<'c> {
        let library_index = self
            .import_libraries
            .iter()
            .position(|lib| lib.name.eq_ignore_ascii_case(library_name));
        let library_index = match library_index {
            Some(index) => index,
            None => {
                self.import_libraries.push(ImportLibrary {
                    name: library_name,
                    symbols: Vec::new(),
                });
                self.import_libraries.len() - 1
            }
        };
        let existing = self.import_libraries[library_index]
            .symbols
            .iter()
            .find(|symbol| symbol.name == symbol_name)
            .map(|symbol| symbol.label);
        let label = match existing {
            Some(label) => label,
            None => {
                let label = self.labels.push(LabelData {
                    name: symbol_name,
                    resolved: false,
                    section: self.data_section,
                    offset_in_section: 0,
                });
                self.import_libraries[library_index]
                    .symbols
                    .push(ImportSymbol {
                        name: symbol_name,
                        label,
                    });
                label
            }
        };
        Storage::rip_relative(label, Bits(64))
    }
}
