//! Topology document parsing and variable interpolation

mod interpolation;
mod topology_file;

pub use interpolation::*;
pub use topology_file::*;
