//! Chat domain types.

mod models;

pub use models::*;
