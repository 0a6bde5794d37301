//! Database module for PostgreSQL persistence.

mod applied_ops;
mod entities;
mod pool;

pub use applied_ops::*;
pub use entities::*;
pub use pool::*;
