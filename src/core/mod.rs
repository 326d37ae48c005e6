//! Core module containing the session machinery
//!
//! This module provides:
//! - Pattern watchers for abort / end rules
//! - Session timer and the single-resolution guard
//! - Device link contract and the serial implementation
//! - Power control and power cycling
//! - Termination race orchestrator
//! - External runner supervisor
//! - Scriptable device simulator
//! - Log artifacts and CI outputs

pub mod artifacts;
pub mod link;
pub mod orchestrator;
pub mod outcome;
pub mod power;
pub mod shell;
pub mod simulator;
pub mod supervisor;
pub mod timer;
pub mod watcher;
