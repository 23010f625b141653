// Copyright 2025 The peweave developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # peweave
//!
//! Reading, editing and rebuilding of Portable Executable files, with first-class support for
//! the .NET (CLI) parts of an image.
//!
//! The crate works on three levels, each built on the one below:
//!
//! - **File** - [`pe::PeFile`] is the raw on-disk structure: DOS header, file and optional
//!   header, section table and section contents. Reading and writing it is lossless.
//! - **Image** - [`image::PeImage`] interprets the data directories of a file: imports,
//!   exports, base relocations, Win32 resources, debug entries and the CLR directory. Every
//!   directory is read on first access.
//! - **Builder** - [`builder::PeFileBuilder`] lays an image out into a fresh file, either
//!   from scratch (managed) or around the original sections (unmanaged).
//!
//! Everything that ends up in a file is a [`segment::Segment`]: a piece of data that can be
//! assigned a file offset and an RVA, measured, and written. Segments are composed with
//! [`segment::SegmentBuilder`] and patched with [`segment::PatchedSegment`], which is how the
//! builders place data without knowing its final location in advance.
//!
//! CIL method bodies live in [`cil`]: raw bodies are read and written as they are, and
//! structured bodies can be disassembled, edited and assembled again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peweave::prelude::*;
//!
//! let image = PeImage::from_path("app.exe")?;
//! for module in image.imports()? {
//!     println!("{}: {} symbols", module.name, module.symbols.len());
//! }
//!
//! let mut file = PeFileBuilder::managed().create_file(&image)?;
//! std::fs::write("app.rebuilt.exe", file.to_bytes()?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`io`] - data sources, bounded readers and writers
//! - [`segment`] - the segment model and address references
//! - [`pe`] - headers, sections and the file itself
//! - [`metadata`] - the CLI metadata root, streams, heaps and tables
//! - [`cil`] - method bodies, instructions and exception handlers
//! - [`image`] - the interpreted data directories
//! - [`builder`] - directory buffers and file layout
//! - [`diagnostics`] - error listeners for recoverable problems
//! - [`lazy`] - lazily initialized values and lists
//! - [`Error`] and [`Result`] - error handling
//!
//! ## Error Handling
//!
//! Structural errors are returned as [`Error`]. Problems a caller may want to tolerate, such as
//! a method body that cannot be decoded, go through a [`diagnostics::ErrorListener`] instead;
//! the default [`diagnostics::ThrowErrorListener`] turns them into errors, while
//! [`diagnostics::DiagnosticsErrorListener`] collects them and carries on.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use peweave::prelude::*;
///
/// let file = PeFile::from_path("library.dll")?;
/// println!("{} sections", file.sections.len());
/// # Ok::<(), peweave::Error>(())
/// ```
pub mod prelude;

pub mod builder;
pub mod cil;
pub mod diagnostics;
pub mod image;
pub mod io;
pub mod lazy;
pub mod metadata;
pub mod pe;
pub mod segment;
pub mod utils;

/// `peweave` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use peweave::{pe::PeFile, Result};
///
/// fn count_sections(path: &str) -> Result<usize> {
///     Ok(PeFile::from_path(path)?.sections.len())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `peweave` Error type
///
/// Covers format, range and construction errors, plus anything a
/// [`diagnostics::ErrorListener`] escalates.
pub use error::Error;
