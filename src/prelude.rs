//! # peweave Prelude
//!
//! The types most programs need to read an image, edit it and write it back. Import the
//! module with a glob to get all of them at once.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peweave operations
pub use crate::Error;

/// The result type used throughout peweave
pub use crate::Result;

/// Recoverable problem reporting
pub use crate::diagnostics::{
    DiagnosticsErrorListener, EmptyErrorListener, ErrorListener, ThrowErrorListener,
};

// ================================================================================================
// File and Image
// ================================================================================================

/// The raw file model
pub use crate::pe::{
    DataDirectory, DataDirectoryIndex, MachineType, PeFile, PeSection, ReaderParameters,
    SectionFlags,
};

/// The interpreted image and its directories
pub use crate::image::{
    BaseRelocation, DebugDataEntry, DotNetDirectory, ExportDirectory, ExportedSymbol,
    ImportedModule, ImportedSymbol, PeImage, ResourceDirectory, ResourceEntry,
};

/// Rebuilding images into files
pub use crate::builder::{BuilderConfig, BuilderKind, PeFileBuilder};

// ================================================================================================
// Segments and I/O
// ================================================================================================

/// Layout units and references to them
pub use crate::segment::{
    DataSegment, RelocationParameters, Segment, SegmentBuilder, SegmentRef, VirtualAddress,
};

/// Readers and writers
pub use crate::io::{BinaryStreamReader, BinaryStreamWriter, MemoryStreamWriter};

// ================================================================================================
// Metadata and CIL
// ================================================================================================

/// Metadata tokens and the metadata directory
pub use crate::metadata::{Metadata, TableIndex, Token};

/// Method bodies and instructions
pub use crate::cil::{
    CilCode, CilInstruction, CilMethodBody, CilOperand, CilRawMethodBody, DefaultOperandBuilder,
};
