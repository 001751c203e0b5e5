//! # Error Taxonomy
//!
//! Every failure in the loader, the compiler and the bridge is reported as a
//! [`WaveError`]. None of them is recoverable: the caller is expected to
//! abandon the module.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, WaveError>;

/// Runtime error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaveError {
    /// Ran out of bytes mid-read.
    #[error("unexpected end of input")]
    Truncated,
    /// LEB128 integer does not fit its declared width.
    #[error("malformed LEB128 integer")]
    MalformedVarint,
    /// Magic number or version is wrong.
    #[error("invalid module header: {0}")]
    InvalidHeader(String),
    /// Structurally invalid section payload.
    #[error("malformed section: {0}")]
    MalformedSection(String),
    /// Initializer expression outside the supported grammar.
    #[error("malformed constant expression (opcode 0x{0:02x})")]
    MalformedConstExpr(u8),
    /// Index or offset beyond a table, memory or block-depth bound.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),
    /// Valid construct that this runtime does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    /// The executable plane is full.
    #[error("code buffer exhausted")]
    CodeBufferExhausted,
    /// Byte does not name any known opcode.
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    /// Import names a builtin that does not exist.
    #[error("unknown builtin `{module}.{name}`")]
    UnknownBuiltin { module: String, name: String },
    /// No export with this name and kind.
    #[error("export `{0}` not found")]
    ExportNotFound(String),
    /// Host-supplied arguments do not match the function type.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),
    /// Compiler state is already borrowed by an outer compile.
    #[error("runtime is busy compiling")]
    RuntimeBusy,
    /// The OS memory service failed.
    #[error("{op} failed (errno {errno})")]
    Os { op: &'static str, errno: i32 },
}

impl WaveError {
    /// Short category name used by diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            WaveError::Truncated => "Truncated",
            WaveError::MalformedVarint => "MalformedVarint",
            WaveError::InvalidHeader(_) => "InvalidHeader",
            WaveError::MalformedSection(_) => "MalformedSection",
            WaveError::MalformedConstExpr(_) => "MalformedConstExpr",
            WaveError::OutOfBounds(_) => "OutOfBounds",
            WaveError::UnsupportedFeature(_) => "UnsupportedFeature",
            WaveError::CodeBufferExhausted => "CodeBufferExhausted",
            WaveError::InvalidOpcode(_) => "InvalidOpcode",
            WaveError::UnknownBuiltin { .. } => "UnknownBuiltin",
            WaveError::ExportNotFound(_) => "ExportNotFound",
            WaveError::SignatureMismatch(_) => "SignatureMismatch",
            WaveError::RuntimeBusy => "RuntimeBusy",
            WaveError::Os { .. } => "Os",
        }
    }

    /// Capture `errno` after a failed libc call.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        WaveError::Os {
            op,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_category() {
        let err = WaveError::UnknownBuiltin {
            module: "env".into(),
            name: "nope".into(),
        };
        assert_eq!(err.to_string(), "unknown builtin `env.nope`");
        assert_eq!(err.category(), "UnknownBuiltin");
        assert_eq!(WaveError::InvalidOpcode(0xfe).to_string(), "invalid opcode 0xfe");
    }
}
