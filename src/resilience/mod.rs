//! Connection health tracking and retry for store connections.

pub mod health;
pub mod retry;
