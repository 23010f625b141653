//! Builders for synthetic test inputs.

pub mod pe;
pub mod image;
