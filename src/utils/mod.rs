//! Small helpers shared across the crate.

mod math;

pub use math::{align_up, align_up_u32, is_power_of_two, to_u32};
