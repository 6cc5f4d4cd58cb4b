//! Storage layer for persistence.

mod extent;
mod gc;
mod locks;
mod metadata;

pub use extent::*;
pub use gc::*;
pub use locks::*;
pub use metadata::*;
