//! Error taxonomy.
//!
//! Every failure the compiler can report is one variant of [`ErrorKind`];
//! the human-readable rendering lives in the display attributes here and
//! nowhere else. Front-end variants are carried through the backend
//! unchanged so a single `Result` type spans the pipeline.

/// A half-open byte range into the source file an error points at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("{0}")]
    UserDefined(String),
    #[error("parse error")]
    Parse,
    #[error("unexpected token")]
    UnexpectedToken,
    #[error("invalid identifier")]
    InvalidIdentifier,
    #[error("value does not fit into {descriptor}")]
    IntegerRange { descriptor: String },
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("type {type_name} has no field {field_name}")]
    UnknownField {
        type_name: String,
        field_name: String,
    },
    #[error("redefinition of {0}")]
    Redefinition(String),
    #[error("undefined variable {0}")]
    UndefinedVariable(String),
    #[error("no matching overload for {0}")]
    NoMatchingOverload(String),
    #[error("could not decide between multiple matching overloads for {0}")]
    UndecidableOverload(String),
    #[error("{0} is not a function and can not be overloaded")]
    NonFunctionOverload(String),
    #[error("a default argument may only be followed by other default arguments")]
    NonTrailingDefaultArgument,
    #[error("value is not available in this compilation epoch")]
    EpochMismatch,
    #[error("recursive use of an intrinsic")]
    RecursiveIntrinsicUse,
    #[error("circular dependency involving {0}")]
    CircularDependency(String),
    #[error("declaration has no runtime use")]
    NoRuntimeUse,
    #[error("can not assign to a constant")]
    AssignmentToConstant,
    #[error("fixity conflict for operator {0}")]
    OperatorFixityConflict(String),
    #[error("can not load dynamic library {0}")]
    DynamicLibraryLoad(String),
    #[error("can not open file {0}")]
    FileOpen(String),
    #[error("no matching encoding for `{mnemonic}` with operands {operands}")]
    NoMatchingEncoding { mnemonic: String, operands: String },
    #[error("branch target out of the signed 32-bit displacement range")]
    DisplacementOutOfRange,
}

/// An error with the source position it refers to, when one exists.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
    pub source_range: SourceRange,
}

impl Error {
    pub fn new(kind: ErrorKind, source_range: SourceRange) -> Self {
        Error { kind, source_range }
    }

    pub fn unimplemented(what: impl Into<String>, source_range: SourceRange) -> Self {
        Error::new(ErrorKind::Unimplemented(what.into()), source_range)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_is_centralized() {
        let error = Error::new(
            ErrorKind::TypeMismatch {
                expected: "s64".into(),
                actual: "f32".into(),
            },
            SourceRange::default(),
        );
        assert_eq!(error.to_string(), "type mismatch: expected s64, got f32");
    }
}
