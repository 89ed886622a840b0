//! x86-64 code generation for the Mass compiler.
//!
//! The front end hands this crate fully elaborated functions (a
//! [`FunctionInfo`] signature plus an abstract instruction stream) and
//! gets back encoded machine code with a resolved label and section table.
//! The pieces, in data-flow order:
//!
//! - [`abi`] computes a [`abi::FunctionCallSetup`] describing where each
//!   parameter and the return value live for a calling convention;
//! - [`FunctionBuilder`] accumulates instructions, tracks register
//!   occupancy and hands out stack slots;
//! - the stack resolver fixes the frame layout when a function ends,
//!   rewriting symbolic stack displacements and shrinking the ones that
//!   fit in a signed byte;
//! - the encoder turns each instruction into bytes inside a
//!   [`Program`] section, recording label patches;
//! - [`Program::patch_labels`] links every recorded site once all label
//!   offsets are known.
//!
//! Everything runs single-threaded; descriptors and interned data live in
//! a [`Compilation`] arena for the duration of the build.

pub mod abi;
pub mod builder;
pub mod context;
pub mod descriptor;
pub mod encoder;
pub mod encoding;
pub mod error;
pub mod function;
pub mod instruction;
pub mod mnemonics;
pub mod program;
pub mod storage;

mod emit;
mod frame;

pub use builder::FunctionBuilder;
pub use context::Compilation;
pub use emit::encode_function;
pub use error::{Error, ErrorKind, Result, SourceRange};
pub use function::{FunctionInfo, FunctionLayout, FunctionParameter};
pub use program::{Label, Program, Section, SectionId, SectionPermissions};
pub use storage::{Bits, CompareType, Register, StackArea, Storage, StorageKind};
