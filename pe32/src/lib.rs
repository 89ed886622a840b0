//! PE32+ image writer.
//!
//! Serializes a linked [`Program`] into a Windows executable: `.rdata`
//! carries the program's constant data, the import tables and the
//! exception/unwind directories; `.text` carries the encoded functions.
//! Sections get their RVAs here, functions are encoded, labels are patched
//! and the standard headers are written around the result.

mod image;
mod unwind;

pub use unwind::{unwind_info_for_function, RuntimeFunction, UnwindInfo};

use std::path::Path;

use bytemuck::Zeroable;
use log::debug;

use image::*;
use mass_codegen::program::SectionPermissions;
use mass_codegen::{
    encode_function, Error, ErrorKind, FunctionLayout, Program, SourceRange,
};

/// Which Windows subsystem the image declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutableType {
    Gui,
    Cli,
}

fn align_u32(value: u32, alignment: u32) -> u32 {
    value.next_multiple_of(alignment)
}

fn section_characteristics(permissions: SectionPermissions) -> u32 {
    let mut characteristics = 0;
    if permissions.contains(SectionPermissions::EXECUTE) {
        characteristics |= IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE;
    } else {
        characteristics |= IMAGE_SCN_CNT_INITIALIZED_DATA;
    }
    if permissions.contains(SectionPermissions::WRITE) {
        characteristics |= IMAGE_SCN_MEM_WRITE;
    }
    if permissions.contains(SectionPermissions::READ) {
        characteristics |= IMAGE_SCN_MEM_READ;
    }
    characteristics
}

struct EncodedRdataSection {
    buffer: Vec<u8>,
    iat_rva: u32,
    iat_size: u32,
    import_directory_rva: u32,
    import_directory_size: u32,
    exception_directory_rva: u32,
    exception_directory_size: u32,
    unwind_info_base_rva: u32,
    /// Buffer offsets of the zeroed exception/unwind arrays, filled in once
    /// the functions are encoded.
    runtime_function_offset: usize,
    unwind_info_offset: usize,
}

/// Lay out `.rdata`: the program's data-section bytes first (so data labels
/// keep their offsets), then per-symbol hint/name entries, the IAT, the
/// image thunks, the library name strings, the import descriptors, and the
/// exception directory with its unwind records.
fn encode_rdata_section(
    program: &mut Program<'_>,
    header: &mut ImageSectionHeader,
) -> EncodedRdataSection {
    let data_section = program.data_section;
    program.sections[data_section].base_rva = header.virtual_address;

    let mut buffer = Vec::new();

    let global_data = program.sections[data_section].buffer.clone();
    buffer.extend_from_slice(&global_data);
    buffer.resize(align_u32(buffer.len() as u32, 16) as usize, 0);

    // Hint/name table entries; remember each symbol's entry RVA.
    let mut symbol_rvas: Vec<Vec<u32>> = Vec::with_capacity(program.import_libraries.len());
    for library in &program.import_libraries {
        let mut rvas = Vec::with_capacity(library.symbols.len());
        for symbol in &library.symbols {
            rvas.push(header.virtual_address + buffer.len() as u32);
            buffer.extend_from_slice(&0u16.to_le_bytes()); // ordinal hint
            buffer.extend_from_slice(symbol.name.as_bytes());
            buffer.push(0);
            if (symbol.name.len() + 1) % 2 != 0 {
                buffer.push(0);
            }
        }
        symbol_rvas.push(rvas);
    }

    // The import address table: one thunk array per library, each slot the
    // RVA of the symbol's hint/name entry, zero-terminated. Each slot is
    // where the loader writes the resolved address, so the symbol's label
    // resolves here.
    let iat_rva = header.virtual_address + buffer.len() as u32;
    let mut iat_library_rvas = Vec::with_capacity(program.import_libraries.len());
    let mut import_label_offsets = Vec::new();
    for (library_index, library) in program.import_libraries.iter().enumerate() {
        iat_library_rvas.push(header.virtual_address + buffer.len() as u32);
        for (symbol_index, symbol) in library.symbols.iter().enumerate() {
            import_label_offsets.push((symbol.label, buffer.len() as u32));
            buffer.extend_from_slice(
                &(symbol_rvas[library_index][symbol_index] as u64).to_le_bytes(),
            );
        }
        buffer.extend_from_slice(&0u64.to_le_bytes());
    }
    let iat_size = header.virtual_address + buffer.len() as u32 - iat_rva;
    for (label, offset) in import_label_offsets {
        program.set_label_offset(label, offset);
    }

    // Image thunk tables: the same shape as the IAT, kept as the loader's
    // pristine copy.
    let mut image_thunk_rvas = Vec::with_capacity(program.import_libraries.len());
    for (library_index, library) in program.import_libraries.iter().enumerate() {
        image_thunk_rvas.push(header.virtual_address + buffer.len() as u32);
        for symbol_index in 0..library.symbols.len() {
            buffer.extend_from_slice(
                &(symbol_rvas[library_index][symbol_index] as u64).to_le_bytes(),
            );
        }
        buffer.extend_from_slice(&0u64.to_le_bytes());
    }

    // Library name strings.
    let mut name_rvas = Vec::with_capacity(program.import_libraries.len());
    for library in &program.import_libraries {
        name_rvas.push(header.virtual_address + buffer.len() as u32);
        buffer.extend_from_slice(library.name.as_bytes());
        buffer.push(0);
        if (library.name.len() + 1) % 2 != 0 {
            buffer.push(0);
        }
    }

    // The import directory, one descriptor per library.
    let import_directory_rva = header.virtual_address + buffer.len() as u32;
    for library_index in 0..program.import_libraries.len() {
        let descriptor = ImageImportDescriptor {
            original_first_thunk: image_thunk_rvas[library_index],
            time_date_stamp: 0,
            forwarder_chain: 0,
            name: name_rvas[library_index],
            first_thunk: iat_library_rvas[library_index],
        };
        buffer.extend_from_slice(bytemuck::bytes_of(&descriptor));
    }
    let import_directory_size =
        header.virtual_address + buffer.len() as u32 - import_directory_rva;
    buffer.extend_from_slice(bytemuck::bytes_of(&ImageImportDescriptor::zeroed()));

    // Exception directory: zeroed for now, filled once the text section is
    // encoded and the function layouts are known.
    let function_count = program.functions.len();
    let exception_directory_rva = header.virtual_address + buffer.len() as u32;
    let runtime_function_offset = buffer.len();
    buffer.resize(
        buffer.len() + function_count * core::mem::size_of::<RuntimeFunction>(),
        0,
    );
    let exception_directory_size =
        header.virtual_address + buffer.len() as u32 - exception_directory_rva;

    // Unwind info must be DWORD aligned.
    buffer.resize(align_u32(buffer.len() as u32, 4) as usize, 0);
    let unwind_info_base_rva = header.virtual_address + buffer.len() as u32;
    let unwind_info_offset = buffer.len();
    buffer.resize(
        buffer.len() + function_count * core::mem::size_of::<UnwindInfo>(),
        0,
    );

    header.virtual_size = buffer.len() as u32;
    header.size_of_raw_data = align_u32(buffer.len() as u32, PE32_FILE_ALIGNMENT);

    EncodedRdataSection {
        buffer,
        iat_rva,
        iat_size,
        import_directory_rva,
        import_directory_size,
        exception_directory_rva,
        exception_directory_size,
        unwind_info_base_rva,
        runtime_function_offset,
        unwind_info_offset,
    }
}

struct EncodedTextSection {
    entry_point_rva: u32,
    layouts: Vec<FunctionLayout>,
}

fn encode_text_section(
    program: &mut Program<'_>,
    header: &mut ImageSectionHeader,
) -> Result<EncodedTextSection, Error> {
    let code_section = program.code_section;
    program.sections[code_section].base_rva = header.virtual_address;

    let entry_point = program.entry_point.ok_or_else(|| {
        Error::new(
            ErrorKind::Unimplemented("program has no entry point".to_string()),
            SourceRange::default(),
        )
    })?;

    let mut entry_point_rva = None;
    let mut layouts = Vec::with_capacity(program.functions.len());
    let mut functions = core::mem::take(&mut program.functions);
    let result = (|| {
        for builder in &mut functions {
            if core::ptr::eq(builder.function, entry_point) {
                entry_point_rva = Some(
                    header.virtual_address + program.sections[code_section].current_offset(),
                );
            }
            layouts.push(encode_function(program, code_section, builder)?);
        }
        Ok(())
    })();
    program.functions = functions;
    result?;

    // Every offset is known now; fix up all the label references.
    program.patch_labels()?;

    let entry_point_rva = entry_point_rva.ok_or_else(|| {
        Error::new(
            ErrorKind::Unimplemented(
                "entry point is not in the program's function list".to_string(),
            ),
            SourceRange::default(),
        )
    })?;

    let code_size = program.sections[code_section].current_offset();
    header.virtual_size = code_size;
    header.size_of_raw_data = align_u32(code_size, PE32_FILE_ALIGNMENT);

    Ok(EncodedTextSection {
        entry_point_rva,
        layouts,
    })
}

/// Write `program` to `file_path` as a PE32+ executable.
pub fn write_executable(
    program: &mut Program<'_>,
    executable_type: ExecutableType,
    file_path: &Path,
) -> Result<(), Error> {
    let image_bytes = encode_executable(program, executable_type)?;
    std::fs::write(file_path, image_bytes).map_err(|_| {
        Error::new(
            ErrorKind::FileOpen(file_path.display().to_string()),
            SourceRange::default(),
        )
    })
}

/// Assemble the whole image in memory.
pub fn encode_executable(
    program: &mut Program<'_>,
    executable_type: ExecutableType,
) -> Result<Vec<u8>, Error> {
    let mut rdata_header = ImageSectionHeader::named(".rdata");
    rdata_header.characteristics =
        section_characteristics(program.sections[program.data_section].permissions);
    let mut text_header = ImageSectionHeader::named(".text");
    text_header.characteristics =
        section_characteristics(program.sections[program.code_section].permissions);

    let section_count = 2u16;
    let file_size_of_headers = align_u32(
        (SIZE_OF_HEADERS_UP_TO_SECTIONS
            + (section_count as usize + 1) * core::mem::size_of::<ImageSectionHeader>())
            as u32,
        PE32_FILE_ALIGNMENT,
    );
    let virtual_size_of_headers = align_u32(file_size_of_headers, PE32_SECTION_ALIGNMENT);

    rdata_header.pointer_to_raw_data = file_size_of_headers;
    rdata_header.virtual_address = virtual_size_of_headers;
    let mut rdata = encode_rdata_section(program, &mut rdata_header);

    text_header.pointer_to_raw_data =
        rdata_header.pointer_to_raw_data + rdata_header.size_of_raw_data;
    text_header.virtual_address = rdata_header.virtual_address
        + align_u32(rdata_header.size_of_raw_data, PE32_SECTION_ALIGNMENT);
    let text = encode_text_section(program, &mut text_header)?;

    // With the function layouts known, fill the exception directory and the
    // unwind records reserved in `.rdata`.
    for (index, (builder, layout)) in program
        .functions
        .iter()
        .zip(text.layouts.iter())
        .enumerate()
    {
        let unwind_info_address =
            rdata.unwind_info_base_rva + (index * core::mem::size_of::<UnwindInfo>()) as u32;
        let runtime_function = RuntimeFunction {
            begin_address: layout.begin_rva,
            end_address: layout.end_rva,
            unwind_info_address,
        };
        let at = rdata.runtime_function_offset
            + index * core::mem::size_of::<RuntimeFunction>();
        rdata.buffer[at..at + core::mem::size_of::<RuntimeFunction>()]
            .copy_from_slice(bytemuck::bytes_of(&runtime_function));

        let info = unwind_info_for_function(builder, layout);
        let at = rdata.unwind_info_offset + index * core::mem::size_of::<UnwindInfo>();
        rdata.buffer[at..at + core::mem::size_of::<UnwindInfo>()]
            .copy_from_slice(bytemuck::bytes_of(&info));
    }

    let virtual_size_of_image =
        text_header.virtual_address + align_u32(text_header.size_of_raw_data, PE32_SECTION_ALIGNMENT);

    debug!(
        "image: headers {:#x} rdata {:#x}+{:#x} text {:#x}+{:#x} entry {:#x}",
        file_size_of_headers,
        rdata_header.virtual_address,
        rdata_header.virtual_size,
        text_header.virtual_address,
        text_header.virtual_size,
        text.entry_point_rva,
    );

    let dos_header = ImageDosHeader {
        e_magic: IMAGE_DOS_SIGNATURE,
        e_lfanew: core::mem::size_of::<ImageDosHeader>() as u32,
        ..ImageDosHeader::zeroed()
    };

    let time_date_stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as u32)
        .unwrap_or(0);

    let file_header = ImageFileHeader {
        machine: IMAGE_FILE_MACHINE_AMD64,
        number_of_sections: section_count,
        time_date_stamp,
        pointer_to_symbol_table: 0,
        number_of_symbols: 0,
        size_of_optional_header: core::mem::size_of::<ImageOptionalHeader64>() as u16,
        characteristics: IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE,
    };

    let mut optional_header = ImageOptionalHeader64 {
        magic: IMAGE_NT_OPTIONAL_HDR64_MAGIC,
        size_of_code: text_header.size_of_raw_data,
        size_of_initialized_data: rdata_header.size_of_raw_data,
        address_of_entry_point: text.entry_point_rva,
        base_of_code: text_header.virtual_address,
        // Dynamic base makes the exact value irrelevant.
        image_base: 0x0000_0001_4000_0000,
        section_alignment: PE32_SECTION_ALIGNMENT,
        file_alignment: PE32_FILE_ALIGNMENT,
        major_operating_system_version: PE32_MIN_WINDOWS_VERSION,
        major_subsystem_version: PE32_MIN_WINDOWS_VERSION,
        size_of_image: virtual_size_of_image,
        size_of_headers: file_size_of_headers,
        subsystem: match executable_type {
            ExecutableType::Cli => IMAGE_SUBSYSTEM_WINDOWS_CUI,
            ExecutableType::Gui => IMAGE_SUBSYSTEM_WINDOWS_GUI,
        },
        dll_characteristics: IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA
            | IMAGE_DLLCHARACTERISTICS_NX_COMPAT
            | IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
            | IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE,
        size_of_stack_reserve: 0x100000,
        size_of_stack_commit: 0x1000,
        size_of_heap_reserve: 0x100000,
        size_of_heap_commit: 0x1000,
        number_of_rva_and_sizes: IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32,
        ..ImageOptionalHeader64::zeroed()
    };
    optional_header.data_directory[IAT_DIRECTORY_INDEX] = ImageDataDirectory {
        virtual_address: rdata.iat_rva,
        size: rdata.iat_size,
    };
    optional_header.data_directory[IMPORT_DIRECTORY_INDEX] = ImageDataDirectory {
        virtual_address: rdata.import_directory_rva,
        size: rdata.import_directory_size,
    };
    optional_header.data_directory[EXCEPTION_DIRECTORY_INDEX] = ImageDataDirectory {
        virtual_address: rdata.exception_directory_rva,
        size: rdata.exception_directory_size,
    };

    let mut image = Vec::with_capacity(
        (file_size_of_headers + rdata_header.size_of_raw_data + text_header.size_of_raw_data)
            as usize,
    );
    image.extend_from_slice(bytemuck::bytes_of(&dos_header));
    image.extend_from_slice(&IMAGE_NT_SIGNATURE.to_le_bytes());
    image.extend_from_slice(bytemuck::bytes_of(&file_header));
    image.extend_from_slice(bytemuck::bytes_of(&optional_header));
    image.extend_from_slice(bytemuck::bytes_of(&rdata_header));
    image.extend_from_slice(bytemuck::bytes_of(&text_header));
    image.extend_from_slice(bytemuck::bytes_of(&ImageSectionHeader::zeroed()));

    image.resize(rdata_header.pointer_to_raw_data as usize, 0);
    image.extend_from_slice(&rdata.buffer);
    image.resize(
        (rdata_header.pointer_to_raw_data + rdata_header.size_of_raw_data) as usize,
        0,
    );

    image.resize(text_header.pointer_to_raw_data as usize, 0);
    let code = &program.sections[program.code_section].buffer;
    image.extend_from_slice(code);
    image.resize(
        (text_header.pointer_to_raw_data + text_header.size_of_raw_data) as usize,
        0,
    );

    Ok(image)
}
