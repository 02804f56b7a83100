//! # pwmon
//!
//! Battery-powered power monitor: a collector logs power and battery history
//! into a wear-leveling circular flash log, and a receiver pulls that history
//! over a lossy half-duplex radio link.
//!
//! This library provides:
//! - `storage`: the circular flash log and history downsampler
//! - `proto`: the wire protocol and link framing
//! - `link`: the radio seam, a serial modem and simulated air
//! - `collector`: sampling policy, fragment serving and the collector loop
//! - `receiver`: the sync state machine, statistics, console and receiver loop
//! - `telemetry`: export of synced history as JSON Lines

pub mod bitmap;
pub mod collector;
pub mod config;
pub mod error;
pub mod flash;
pub mod link;
pub mod proto;
pub mod receiver;
pub mod storage;
pub mod telemetry;
