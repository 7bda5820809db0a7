//! Validated service topology

mod load;
mod model;

pub use load::*;
pub use model::*;
