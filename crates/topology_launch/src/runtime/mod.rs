//! Runtime components: dependency ordering, container runtimes and the launcher

pub mod container;
pub mod dependency;
pub mod launcher;
pub mod process;

pub use container::*;
pub use dependency::*;
pub use launcher::*;
pub use process::*;
