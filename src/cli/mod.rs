//! CLI Module
//!
//! Exit codes for CI pipelines and automation.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
