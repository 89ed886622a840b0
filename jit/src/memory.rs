//! Page-aligned memory for generated code.

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use mass_codegen::{Error, ErrorKind, SourceRange};

/// A page-aligned allocation whose protection can be flipped once the code
/// has been copied in.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl ExecutableMemory {
    pub fn allocate(size: usize) -> Result<Self, Error> {
        let page_size = region::page::size();
        let size = size.next_multiple_of(page_size).max(page_size);
        let layout = Layout::from_size_align(size, page_size).expect("valid layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::new(
                ErrorKind::Unimplemented("out of memory for generated code".to_string()),
                SourceRange::default(),
            )
        })?;
        Ok(ExecutableMemory { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Flip a page-aligned range to read+execute.
    pub fn make_executable(&self, offset: usize, length: usize) -> Result<(), Error> {
        self.protect(offset, length, region::Protection::ReadExecute)
    }

    /// Flip a page-aligned range to read-only.
    pub fn make_read_only(&self, offset: usize, length: usize) -> Result<(), Error> {
        self.protect(offset, length, region::Protection::Read)
    }

    fn protect(
        &self,
        offset: usize,
        length: usize,
        protection: region::Protection,
    ) -> Result<(), Error> {
        debug_assert_eq!(offset % region::page::size(), 0);
        debug_assert!(offset + length <= self.layout.size());
        unsafe {
            region::protect(self.ptr.as_ptr().add(offset), length, protection).map_err(|_| {
                Error::new(
                    ErrorKind::Unimplemented(
                        "could not change code memory protection".to_string(),
                    ),
                    SourceRange::default(),
                )
            })
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            // The allocator expects the pages back writable.
            let _ = region::protect(
                self.ptr.as_ptr(),
                self.layout.size(),
                region::Protection::ReadWrite,
            );
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}
