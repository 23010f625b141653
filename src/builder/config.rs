use std::{fmt, sync::Arc};

use crate::{
    diagnostics::{DiagnosticsErrorListener, EmptyErrorListener, ErrorListenerRef, ThrowErrorListener},
    image::{DefaultFieldRvaDataReader, FieldRvaDataReader},
};

/// Default `FileAlignment` of built files.
pub const DEFAULT_FILE_ALIGNMENT: u32 = 0x200;
/// Default `SectionAlignment` of built files.
pub const DEFAULT_SECTION_ALIGNMENT: u32 = 0x2000;

/// Settings used while turning an image into a file.
#[derive(Clone)]
pub struct BuilderConfig {
    /// Receives problems that do not prevent a file from being built, such as method bodies
    /// that cannot be relocated.
    pub error_listener: ErrorListenerRef,
    /// Locates field initialization data that was not replaced explicitly.
    pub field_rva_reader: Arc<dyn FieldRvaDataReader>,
    /// Overrides the `FileAlignment` taken from the original file.
    pub file_alignment: Option<u32>,
    /// Overrides the `SectionAlignment` taken from the original file.
    pub section_alignment: Option<u32>,
    /// `SizeOfStackReserve`.
    pub size_of_stack_reserve: u64,
    /// `SizeOfStackCommit`.
    pub size_of_stack_commit: u64,
    /// `SizeOfHeapReserve`.
    pub size_of_heap_reserve: u64,
    /// `SizeOfHeapCommit`.
    pub size_of_heap_commit: u64,
    /// `MajorOperatingSystemVersion` / `MinorOperatingSystemVersion`.
    pub operating_system_version: (u16, u16),
    /// `MajorSubsystemVersion` / `MinorSubsystemVersion`.
    pub subsystem_version: (u16, u16),
    /// Compute the optional header checksum instead of writing 0.
    pub compute_checksum: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            error_listener: Arc::new(ThrowErrorListener),
            field_rva_reader: Arc::new(DefaultFieldRvaDataReader),
            file_alignment: None,
            section_alignment: None,
            size_of_stack_reserve: 0x0010_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x0010_0000,
            size_of_heap_commit: 0x1000,
            operating_system_version: (4, 0),
            subsystem_version: (4, 0),
            compute_checksum: false,
        }
    }
}

impl BuilderConfig {
    /// Fails on the first problem.
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    /// Skips whatever cannot be rebuilt.
    #[must_use]
    pub fn permissive() -> Self {
        BuilderConfig {
            error_listener: Arc::new(EmptyErrorListener),
            ..Self::default()
        }
    }

    /// Records problems in `listener` and continues.
    #[must_use]
    pub fn with_diagnostics(listener: Arc<DiagnosticsErrorListener>) -> Self {
        BuilderConfig {
            error_listener: listener,
            ..Self::default()
        }
    }

    /// Writes a valid checksum into the optional header.
    #[must_use]
    pub fn with_checksum(mut self) -> Self {
        self.compute_checksum = true;
        self
    }

    /// Uses fixed alignments instead of the original file's.
    #[must_use]
    pub fn with_alignments(mut self, file_alignment: u32, section_alignment: u32) -> Self {
        self.file_alignment = Some(file_alignment);
        self.section_alignment = Some(section_alignment);
        self
    }
}

impl fmt::Debug for BuilderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderConfig")
            .field("file_alignment", &self.file_alignment)
            .field("section_alignment", &self.section_alignment)
            .field("compute_checksum", &self.compute_checksum)
            .finish_non_exhaustive()
    }
}
