//! Core types, config, errors, and temp-file tracking for voxrag.

pub mod config;
pub mod error;
pub mod temp;
pub mod types;
