use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! not_supported_error {
    ($msg:expr) => {
        crate::Error::NotSupported($msg.to_string())
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::NotSupported(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure classes of the reader and writer pipelines:
///
/// ## Format errors
/// - [`Error::Malformed`] - The input does not follow the PE / CLI encoding rules. Fatal for the
///   structure being parsed; there is no partial recovery.
///
/// ## Range errors
/// - [`Error::EndOfStream`] - A bounded reader window would be exceeded
/// - [`Error::AddressOutOfRange`] - An RVA or file offset is not covered by any section or source
/// - [`Error::IndexOutOfRange`] - An index into a list (parameters, locals, sections) is invalid
///
/// ## Construction errors
/// - [`Error::InvalidOperand`] - An instruction operand does not match its opcode's operand type
/// - [`Error::NullToken`] - A metadata token with a zero row id was about to be written
/// - [`Error::InvalidArgument`] - A caller supplied inconsistent parameters
///
/// ## Recoverable construct errors
/// - [`Error::NotSupported`] - Routed through an [`crate::diagnostics::ErrorListener`] by the builders
///
/// # Examples
///
/// ```rust,no_run
/// use peweave::{Error, pe::PeFile};
/// use std::path::Path;
///
/// match PeFile::from_path(Path::new("program.exe")) {
///     Ok(file) => println!("{} sections", file.sections.len()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed file: {} ({}:{})", message, file, line);
///     }
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// Signature mismatches, invalid method body header bits and other encoding violations
    /// end up here. The error includes the source location where the malformation was
    /// detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A read would have moved past the end of the reader's window.
    #[error("End of stream - requested {requested} bytes at relative offset {relative_offset} of a {length} byte window")]
    EndOfStream {
        /// Offset relative to the start of the window
        relative_offset: u64,
        /// Number of bytes the operation needed
        requested: u64,
        /// Length of the window
        length: u64,
    },

    /// An address is not contained in any section or data source.
    #[error("Address 0x{0:08X} is out of range")]
    AddressOutOfRange(u64),

    /// An index into a list was invalid.
    #[error("Index {index} is out of range for a list of {count} elements")]
    IndexOutOfRange {
        /// The requested index
        index: usize,
        /// Number of elements in the list
        count: usize,
    },

    /// The construct is valid but not supported by this library.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// An instruction was constructed with an operand that does not fit its opcode.
    #[error("Invalid operand for {mnemonic}: {message}")]
    InvalidOperand {
        /// Mnemonic of the offending opcode
        mnemonic: &'static str,
        /// Details about the mismatch
        message: String,
    },

    /// A metadata token with a zero row id was about to be serialized.
    #[error("Attempted to write a null token - {0}")]
    NullToken(Token),

    /// A caller supplied inconsistent arguments.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// Failed to acquire a lock.
    #[error("Failed to lock target")]
    LockError,

    /// Wrapper around `std::io::Error`.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Other errors that don't fit other categories.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Returns `true` if this error belongs to the format error class.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed { .. })
    }

    /// Returns `true` if this error belongs to the out-of-range class.
    #[must_use]
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            Error::EndOfStream { .. } | Error::AddressOutOfRange(_) | Error::IndexOutOfRange { .. }
        )
    }
}
