//! Shared types and small helpers

pub mod helpers;
pub mod types;
