use std::{fmt, sync::Arc};

use crate::diagnostics::{
    DiagnosticsErrorListener, EmptyErrorListener, ErrorListenerRef, ThrowErrorListener,
};

/// How the bytes of a PE file are laid out in the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MappingMode {
    /// The bytes are the file as stored on disk; pointers are file offsets.
    #[default]
    Unmapped,
    /// The bytes are the image as mapped by the loader; pointers are RVAs.
    Mapped,
}

/// Settings used while reading a PE file.
#[derive(Clone)]
pub struct ReaderParameters {
    /// Receives recoverable problems, such as sections whose raw data is cut off.
    pub error_listener: ErrorListenerRef,
    /// Layout of the input bytes.
    pub mapping_mode: MappingMode,
    /// Copy section contents into memory while reading instead of referencing the source.
    pub eager_sections: bool,
}

impl Default for ReaderParameters {
    fn default() -> Self {
        ReaderParameters {
            error_listener: Arc::new(ThrowErrorListener),
            mapping_mode: MappingMode::Unmapped,
            eager_sections: false,
        }
    }
}

impl ReaderParameters {
    /// Fails on the first problem.
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    /// Ignores recoverable problems.
    #[must_use]
    pub fn permissive() -> Self {
        ReaderParameters {
            error_listener: Arc::new(EmptyErrorListener),
            ..Self::default()
        }
    }

    /// Records recoverable problems in `listener` and continues.
    #[must_use]
    pub fn with_diagnostics(listener: Arc<DiagnosticsErrorListener>) -> Self {
        ReaderParameters {
            error_listener: listener,
            ..Self::default()
        }
    }

    /// Reads a mapped image.
    #[must_use]
    pub fn mapped(mut self) -> Self {
        self.mapping_mode = MappingMode::Mapped;
        self
    }
}

impl fmt::Debug for ReaderParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderParameters")
            .field("mapping_mode", &self.mapping_mode)
            .field("eager_sections", &self.eager_sections)
            .finish_non_exhaustive()
    }
}
