//! Snapshot output: display rounding, the JSON file, and the console summary.

pub mod display;
pub mod generator;

pub use display::build_display;
pub use generator::{print_summary, write_snapshot};
