//! # Storage Module
//!
//! Long-running history kept in the collector's flash.
//!
//! This module handles:
//! - Page geometry, page header layout and the domain table
//! - The wear-leveling circular log over raw flash pages
//! - Decimation of raw samples into logged items

pub mod layout;
pub mod log;
pub mod history;

pub use history::{History, HistoryParam};
pub use layout::{Domain, PageHeader, PageImage};
pub use log::{DataLog, LogParam, PageStore};
