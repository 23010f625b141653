//! CLI metadata structures.
//!
//! This module covers the parts of the .NET metadata that the object model and the image
//! builder operate on directly:
//!
//! - [`Token`] and [`TableIndex`] - references into metadata tables
//! - [`Cor20Header`] - the CLR header of the .NET data directory
//! - [`MetadataRoot`] - the `BSJB` root and its stream headers
//! - [`TablesStream`] - table layout, row and column access (`#~`, `#-`)
//! - [`heaps`] - `#Strings`, `#US`, `#Blob` and `#GUID`
//! - [`Metadata`] - a metadata directory with lazily parsed streams
//!
//! Higher-level member and type definitions are not modelled; tables are accessed by row id
//! and column index.
//!
//! # Examples
//!
//! ```rust
//! use peweave::metadata::{
//!     tablestream::{columns, TablesStreamBuilder},
//!     Metadata, MetadataBuilder, TableIndex,
//! };
//!
//! let mut tables = TablesStreamBuilder::new();
//! let method = tables.add_row(TableIndex::MethodDef, vec![0x2050, 0, 0, 0, 0, 1])?;
//!
//! let bytes = MetadataBuilder::new()
//!     .with_stream("#~", tables.build()?)
//!     .build()?;
//! let metadata = Metadata::from_bytes(bytes)?;
//!
//! let tables = metadata.tables()?.expect("tables stream");
//! let rva = tables.read_column(TableIndex::MethodDef, method.rid(), columns::METHOD_DEF_RVA)?;
//! assert_eq!(rva, 0x2050);
//! # Ok::<(), peweave::Error>(())
//! ```

mod codedindex;
mod cor20;
mod directory;
pub mod heaps;
mod root;
pub mod tablestream;
pub mod token;

pub use codedindex::CodedIndex;
pub use cor20::{Cor20Header, DotNetDirectoryFlags};
pub use directory::{Metadata, MetadataBuilder};
pub use root::{MetadataRoot, StreamHeader, METADATA_SIGNATURE};
pub use tablestream::{TablesStream, TablesStreamBuilder};
pub use token::{TableIndex, Token};
