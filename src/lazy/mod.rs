//! Deferred initialization of object-model members.
//!
//! Structures read from an image capture a reader over their variable-length parts and only
//! parse them on first access. The containers here hold either an already known value or a
//! factory that produces it, and make the first access safe when several threads race to
//! trigger it.
//!
//! - [`LazyVariable`] - a single value
//! - [`LazyList`] - a list materialized as a whole
//! - [`GranularLazyList`] - a list of known length whose elements are materialized one by one
//!
//! Factories are fallible. A factory that fails leaves the container uninitialized, so a later
//! access calls it again.
//!
//! ```rust
//! use peweave::lazy::LazyVariable;
//!
//! let lazy = LazyVariable::with_factory(|| Ok(6 * 7));
//! assert!(!lazy.is_initialized());
//! assert_eq!(*lazy.get()?, 42);
//! assert!(lazy.is_initialized());
//! # Ok::<(), peweave::Error>(())
//! ```

mod granular;
mod list;
mod variable;

pub use granular::GranularLazyList;
pub use list::LazyList;
pub use variable::LazyVariable;

use crate::Result;

/// Factory for a [`LazyVariable`].
pub type ValueFactory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Factory for the elements of a [`LazyList`].
pub type ListFactory<T> = Box<dyn Fn() -> Result<Vec<T>> + Send + Sync>;

/// Factory for a single element of a [`GranularLazyList`], given its index.
pub type ItemFactory<T> = Box<dyn Fn(usize) -> Result<T> + Send + Sync>;
