//! Error reporting for recoverable problems.
//!
//! Readers and builders run into two kinds of problems: those that make the current structure
//! unreadable (always returned as an [`Error`]) and those that only affect one member of an
//! otherwise valid image, such as a native method body the builder cannot relocate. The latter
//! are routed through an [`ErrorListener`], which decides whether processing continues.
//!
//! - [`ThrowErrorListener`] escalates every report into an error (the default)
//! - [`EmptyErrorListener`] ignores every report
//! - [`DiagnosticsErrorListener`] records every report and continues
//!
//! ```rust
//! use std::sync::Arc;
//! use peweave::diagnostics::{DiagnosticsErrorListener, ErrorListener};
//!
//! let listener = Arc::new(DiagnosticsErrorListener::new());
//! listener.report_not_supported("native method body at 0x2050").unwrap();
//! assert_eq!(listener.diagnostics().count(), 1);
//! ```
//!
//! # Thread Safety
//!
//! Listeners are shared as `Arc<dyn ErrorListener>` and must be [`Send`] and [`Sync`].
//! [`Diagnostics`] uses `boxcar::Vec` for lock-free appends.

use std::{fmt, sync::Arc};

use strum::Display;

use crate::{metadata::Token, Error, Result};

/// How serious a recorded problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum DiagnosticSeverity {
    /// Data was skipped or kept as it was; the output is still usable.
    #[strum(serialize = "warning")]
    Warning,
    /// A structure could not be read or written.
    #[strum(serialize = "error")]
    Error,
}

/// Which part of the pipeline raised a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DiagnosticCategory {
    /// PE headers, sections and data directories.
    Image,
    /// CLR header, metadata root and tables.
    Metadata,
    /// Layout and serialization of an output file.
    Builder,
}

/// Where a recorded problem was found, when the error carried that information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLocation {
    /// An RVA or file offset.
    Address(u64),
    /// A metadata row.
    Token(Token),
}

impl fmt::Display for DiagnosticLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLocation::Address(address) => write!(f, "0x{address:08X}"),
            DiagnosticLocation::Token(token) => write!(f, "token 0x{:08X}", token.value()),
        }
    }
}

/// One recorded problem.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// How serious the problem is.
    pub severity: DiagnosticSeverity,
    /// Where in the pipeline it was raised.
    pub category: DiagnosticCategory,
    /// The rendered error.
    pub message: String,
    /// Address or token involved, if known.
    pub location: Option<DiagnosticLocation>,
}

impl Diagnostic {
    /// Classifies `error`.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        let (severity, category, location) = match error {
            Error::NotSupported(_) => (DiagnosticSeverity::Warning, DiagnosticCategory::Builder, None),
            Error::Malformed { .. } => (DiagnosticSeverity::Error, DiagnosticCategory::Image, None),
            Error::AddressOutOfRange(address) => (
                DiagnosticSeverity::Error,
                DiagnosticCategory::Image,
                Some(DiagnosticLocation::Address(*address)),
            ),
            Error::NullToken(token) => (
                DiagnosticSeverity::Error,
                DiagnosticCategory::Metadata,
                Some(DiagnosticLocation::Token(*token)),
            ),
            _ => (DiagnosticSeverity::Error, DiagnosticCategory::Builder, None),
        };

        Diagnostic {
            severity,
            category,
            message: error.to_string(),
            location,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.severity, self.category, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

/// Append-only list of diagnostics that can be shared between threads.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `diagnostic`.
    pub fn push(&self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// Number of recorded diagnostics.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Recorded diagnostics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, diagnostic)| diagnostic)
    }

    /// Whether anything worse than a warning was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.iter().any(|d| d.severity == DiagnosticSeverity::Error)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diagnostic in self.iter() {
            writeln!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

/// Sink for recoverable problems.
///
/// Every method returns `Ok(())` to let the caller skip the offending member and continue, or an
/// error to abort the operation. Callers propagate the result with `?`.
pub trait ErrorListener: Send + Sync {
    /// Reports an error. The listener decides whether it is fatal.
    ///
    /// # Errors
    /// Returns the error (or another one) when processing should stop.
    fn register_error(&self, error: Error) -> Result<()>;

    /// Reports a construct that is valid but not supported.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] when processing should stop.
    fn report_not_supported(&self, message: &str) -> Result<()> {
        self.register_error(Error::NotSupported(message.to_string()))
    }

    /// Reports a structural problem in the input image.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] when processing should stop.
    fn bad_image(&self, message: &str) -> Result<()> {
        self.register_error(malformed_error!(message))
    }
}

/// Shared handle to an error listener.
pub type ErrorListenerRef = Arc<dyn ErrorListener>;

/// Escalates every report into an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThrowErrorListener;

impl ErrorListener for ThrowErrorListener {
    fn register_error(&self, error: Error) -> Result<()> {
        Err(error)
    }
}

/// Ignores every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyErrorListener;

impl ErrorListener for EmptyErrorListener {
    fn register_error(&self, error: Error) -> Result<()> {
        tracing::debug!("Ignoring error: {error}");
        Ok(())
    }
}

/// Records every report in a [`Diagnostics`] container and continues.
#[derive(Debug, Default)]
pub struct DiagnosticsErrorListener {
    diagnostics: Diagnostics,
}

impl DiagnosticsErrorListener {
    /// Creates a listener with an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

impl ErrorListener for DiagnosticsErrorListener {
    fn register_error(&self, error: Error) -> Result<()> {
        let diagnostic = Diagnostic::from_error(&error);
        tracing::warn!(category = %diagnostic.category, "{error}");
        self.diagnostics.push(diagnostic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn throw_listener_escalates() {
        let listener = ThrowErrorListener;
        assert!(matches!(
            listener.report_not_supported("x"),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(listener.bad_image("y"), Err(Error::Malformed { .. })));
    }

    #[test]
    fn empty_listener_continues() {
        assert!(EmptyErrorListener.bad_image("ignored").is_ok());
    }

    #[test]
    fn diagnostics_listener_records() {
        let listener = DiagnosticsErrorListener::new();
        listener.report_not_supported("native body").unwrap();
        assert!(!listener.diagnostics().has_errors());

        listener
            .register_error(Error::NullToken(Token::new(0x0A00_0000)))
            .unwrap();

        let diagnostics = listener.diagnostics();
        assert_eq!(diagnostics.count(), 2);
        assert!(diagnostics.has_errors());

        let entry = diagnostics.iter().nth(1).unwrap();
        assert_eq!(entry.category, DiagnosticCategory::Metadata);
        assert_eq!(
            entry.location,
            Some(DiagnosticLocation::Token(Token::new(0x0A00_0000)))
        );
        assert!(diagnostics.to_string().starts_with("warning (Builder): "));
        assert!(entry.to_string().ends_with("at token 0x0A000000"));
    }

    #[test]
    fn diagnostics_from_threads() {
        let listener = Arc::new(DiagnosticsErrorListener::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let listener = Arc::clone(&listener);
                thread::spawn(move || {
                    listener.bad_image(&format!("thread {i}")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(listener.diagnostics().count(), 4);
    }
}
