//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while decoding a pickle or projecting it to JSON.
///
/// Decode-time variants carry the opcode name and the byte offset of the
/// opcode that failed, so a logged error points at the exact spot in the
/// record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The opcode byte is not part of the supported protocols.
    #[error("unsupported opcode {opcode} at offset {offset}")]
    UnsupportedOpcode {
        /// Opcode name, or the raw byte in hex for unknown bytes.
        opcode: String,
        /// Byte offset of the opcode.
        offset: usize,
    },

    /// Input ended in the middle of an opcode or before STOP.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof {
        /// Offset at which more bytes were expected.
        offset: usize,
    },

    /// An opcode needed more stack items than were available.
    #[error("stack underflow in {opcode} at offset {offset}")]
    StackUnderflow {
        /// Opcode name.
        opcode: &'static str,
        /// Byte offset of the opcode.
        offset: usize,
    },

    /// An opcode needed a mark but none was open.
    #[error("no open mark for {opcode} at offset {offset}")]
    MarkUnderflow {
        /// Opcode name.
        opcode: &'static str,
        /// Byte offset of the opcode.
        offset: usize,
    },

    /// A memo fetch referenced a handle that was never stored.
    #[error("memo handle {handle} not found at offset {offset}")]
    UnknownMemo {
        /// Memo handle.
        handle: u32,
        /// Byte offset of the fetching opcode.
        offset: usize,
    },

    /// A memo store reused a handle within one decode pass.
    #[error("memo handle {handle} stored twice at offset {offset}")]
    DuplicateMemo {
        /// Memo handle.
        handle: u32,
        /// Byte offset of the storing opcode.
        offset: usize,
    },

    /// The argument of an opcode could not be parsed.
    #[error("invalid argument for {opcode} at offset {offset}: {message}")]
    InvalidArgument {
        /// Opcode name.
        opcode: &'static str,
        /// Byte offset of the opcode.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// An opcode was applied to a value of the wrong kind.
    #[error("type mismatch in {opcode} at offset {offset}: {message}")]
    TypeMismatch {
        /// Opcode name.
        opcode: &'static str,
        /// Byte offset of the opcode.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// A class reducer rejected its arguments.
    #[error("cannot reduce {class_name}: {message}")]
    Reduce {
        /// Dotted class name.
        class_name: String,
        /// Description of the problem.
        message: String,
    },

    /// The decoded graph cannot be expressed as JSON.
    #[error("projection failed: {message}")]
    Projection {
        /// Description of the problem.
        message: String,
    },

    /// The class pickle of a record did not identify a class.
    #[error("cannot determine class name: {message}")]
    ClassName {
        /// Description of the problem.
        message: String,
    },

    /// The decoder ran out of opcodes without seeing STOP.
    #[error("pickle ended without STOP")]
    MissingStop,
}

impl CodecError {
    /// Create an unsupported opcode error.
    pub fn unsupported_opcode(opcode: impl Into<String>, offset: usize) -> Self {
        Self::UnsupportedOpcode {
            opcode: opcode.into(),
            offset,
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(opcode: &'static str, offset: usize, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            opcode,
            offset,
            message: message.into(),
        }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(opcode: &'static str, offset: usize, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            opcode,
            offset,
            message: message.into(),
        }
    }

    /// Create a reducer error.
    pub fn reduce(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reduce {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    /// Create a projection error.
    pub fn projection(message: impl Into<String>) -> Self {
        Self::Projection {
            message: message.into(),
        }
    }

    /// Create a class name error.
    pub fn class_name(message: impl Into<String>) -> Self {
        Self::ClassName {
            message: message.into(),
        }
    }

    /// Returns the byte offset the error points at, if it has one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::UnsupportedOpcode { offset, .. }
            | Self::UnexpectedEof { offset }
            | Self::StackUnderflow { offset, .. }
            | Self::MarkUnderflow { offset, .. }
            | Self::UnknownMemo { offset, .. }
            | Self::DuplicateMemo { offset, .. }
            | Self::InvalidArgument { offset, .. }
            | Self::TypeMismatch { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}
