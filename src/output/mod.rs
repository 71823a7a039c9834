//! Output formatters for scan results.
//!
//! This module provides a trait for formatting discovered peripherals and a
//! plain-text implementation for terminal output.

pub mod text;

use crate::store::ScannedPeripheral;

/// Trait for formatting a discovered peripheral into one output line.
pub trait OutputFormatter: Send + Sync {
    /// Format a peripheral's latest observation.
    fn format(&self, peripheral: &ScannedPeripheral) -> String;
}
