//! Binary input and output.
//!
//! Everything the object model reads goes through a [`BinaryStreamReader`] over a
//! [`DataSource`]; everything the builders produce goes through a [`BinaryStreamWriter`].
//!
//! # Data sources
//!
//! | Source                     | Backing storage                          |
//! |----------------------------|------------------------------------------|
//! | [`ByteArrayDataSource`]    | owned, reference counted buffer          |
//! | [`MemoryMappedDataSource`] | read-only memory mapping of a file       |
//! | [`StreamDataSource`]       | any `Read + Seek`, guarded by a mutex    |
//! | [`UnmanagedDataSource`]    | raw pointer into the current process     |
//! | [`ZeroesDataSource`]       | nothing, every byte is zero              |
//! | [`DisplacedDataSource`]    | another source, shifted address space    |
//! | [`DataSourceSlice`]        | bounded window over another source       |
//!
//! # Writers
//!
//! - [`MemoryStreamWriter`] - growable `Vec<u8>`
//! - [`IoStreamWriter`] - any `Write + Seek`
//! - [`MmapOutput`] - fixed-size memory-mapped output file

mod memory;
mod output;
mod physical;
mod primitives;
mod reader;
mod source;
mod stream;
mod writer;

pub use memory::ByteArrayDataSource;
pub use output::MmapOutput;
pub use physical::MemoryMappedDataSource;
pub use primitives::{read_le, read_le_at, write_le_at, Primitive};
pub use reader::BinaryStreamReader;
pub use source::{DataSource, DataSourceRef, DataSourceSlice, DisplacedDataSource, ZeroesDataSource};
pub use stream::{StreamDataSource, UnmanagedDataSource};
pub use writer::{BinaryStreamWriter, IoStreamWriter, MemoryStreamWriter};
