//! Formatting helpers for ages and captured text.

pub mod format;

pub use format::{format_age, truncate};
