//! CLI command implementations.

pub mod check_settings;
pub mod simulate;
