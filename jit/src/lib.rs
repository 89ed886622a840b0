//! In-process execution of compiled programs.
//!
//! Lays the program's sections out in one writable region, data first and
//! code on the next page boundary, with section RVAs equal to the region
//! offsets, so the label patcher produces displacements that are valid for
//! the mapped addresses. Once everything is copied in, the code pages are
//! flipped to read+execute and the data pages to read-only.

mod memory;

pub use memory::ExecutableMemory;

use log::debug;

use mass_codegen::{encode_function, Error, ErrorKind, Label, Program, SourceRange};

#[derive(Debug)]
pub struct Jit {
    memory: ExecutableMemory,
    code_offset: usize,
}

/// Encode, link and map `program`; the program's label table afterwards
/// resolves into the returned memory.
///
/// Programs with import libraries are not supported here: resolving them
/// would need the dynamic loader, which the executable path handles via the
/// image import tables instead.
pub fn jit_compile(program: &mut Program<'_>) -> Result<Jit, Error> {
    if let Some(library) = program.import_libraries.first() {
        return Err(Error::new(
            ErrorKind::DynamicLibraryLoad(library.name.to_string()),
            SourceRange::default(),
        ));
    }

    let page_size = region::page::size();
    let data_section = program.data_section;
    let code_section = program.code_section;

    program.sections[data_section].base_rva = 0;
    let data_size = program.sections[data_section].buffer.len();
    let code_offset = data_size.next_multiple_of(page_size);
    program.sections[code_section].base_rva = code_offset as u32;

    let mut functions = core::mem::take(&mut program.functions);
    let result = (|| {
        for builder in &mut functions {
            encode_function(program, code_section, builder)?;
        }
        Ok(())
    })();
    program.functions = functions;
    result?;

    program.patch_labels()?;

    let code_size = program.sections[code_section].buffer.len();
    let mut memory = ExecutableMemory::allocate(code_offset + code_size)?;
    debug!(
        "jit: {} data bytes, {} code bytes at offset {:#x}",
        data_size, code_size, code_offset
    );

    let slice = memory.as_mut_slice();
    slice[..data_size].copy_from_slice(&program.sections[data_section].buffer);
    slice[code_offset..code_offset + code_size]
        .copy_from_slice(&program.sections[code_section].buffer);

    let total = memory.len();
    memory.make_executable(code_offset, total - code_offset)?;
    if data_size > 0 {
        memory.make_read_only(0, code_offset)?;
    }

    Ok(Jit {
        memory,
        code_offset,
    })
}

impl Jit {
    /// Offset of the first code byte inside the mapped region.
    pub fn code_offset(&self) -> usize {
        self.code_offset
    }

    /// The mapped address of a resolved label.
    pub fn label_pointer(&self, program: &Program<'_>, label: Label) -> *const u8 {
        let rva = program.resolve_label_to_rva(label) as usize;
        debug_assert!(rva < self.memory.len());
        unsafe { self.memory.as_ptr().add(rva) }
    }

    /// The mapped address of the program's entry point.
    pub fn entry_pointer(&self, program: &Program<'_>) -> Result<*const u8, Error> {
        let entry_point = program.entry_point.ok_or_else(|| {
            Error::new(
                ErrorKind::Unimplemented("program has no entry point".to_string()),
                SourceRange::default(),
            )
        })?;
        let builder = program
            .functions
            .iter()
            .find(|builder| core::ptr::eq(builder.function, entry_point))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Unimplemented(
                        "entry point is not in the program's function list".to_string(),
                    ),
                    SourceRange::default(),
                )
            })?;
        Ok(self.label_pointer(program, builder.label))
    }
}
