//! # Telemetry Module
//!
//! Exports pages drained from a sync as timestamped samples.
//!
//! This module handles:
//! - Decoding page images into samples in physical units
//! - Timestamping samples from the last collector report
//! - Formatting as JSONL (JSON Lines)
//! - Writing to rotating log files (max N records per file)
//! - Retaining only the last M files

pub mod logger;
pub mod types;

pub use logger::TelemetryLogger;
pub use types::{decode_page, SampleRecord, Timebase};
