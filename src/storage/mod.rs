//! Store handles: the SQL store used in production and an in-memory store
//! with the same transactional and foreign-key semantics.

pub mod memory;
pub mod sql;
pub mod traits;
