//! # Measurement Sources
//!
//! The collector's view of its analog front end: one battery reading and one
//! power measurement per sampling tick.
//!
//! This module handles:
//! - The `Sampler` seam (mocked in tests)
//! - A synthetic load profile for the simulator
//! - Scaling watts into the logged 16-bit unit

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use crate::error::Result;

/// Logged power unit in watts
pub const POWER_UNIT_W: f32 = 0.2;

/// Largest logged power value. All ones would read back as erased flash.
pub const MAX_POWER_CODE: u16 = u16::MAX - 1;

/// Analog front end
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sampler: Send {
    /// Battery voltage in 0.1 mV units
    async fn read_battery(&mut self) -> Result<u16>;

    /// Mains power amplitude in watts
    async fn sample_power(&mut self) -> Result<f32>;
}

/// Scale a power measurement into logged units, clamped to the valid code
/// range
///
/// # Examples
///
/// ```
/// use pwmon::collector::sampler::{scale_power, MAX_POWER_CODE};
///
/// assert_eq!(scale_power(100.0), 500);
/// assert_eq!(scale_power(-3.0), 0);
/// assert_eq!(scale_power(1.0e9), MAX_POWER_CODE);
/// ```
pub fn scale_power(watts: f32) -> u16 {
    let code = (watts / POWER_UNIT_W).round();
    if code.is_nan() || code <= 0.0 {
        0
    } else if code >= f32::from(MAX_POWER_CODE) {
        MAX_POWER_CODE
    } else {
        code as u16
    }
}

/// Deterministic household-like load for the simulator: a daily swing plus
/// seeded noise, on a slowly discharging battery
#[derive(Debug)]
pub struct SyntheticSampler {
    rng: StdRng,
    samples: u64,
    samples_per_day: u64,
    base_w: f64,
    swing_w: f64,
    battery_dmv: f64,
    drain_dmv: f64,
}

impl SyntheticSampler {
    /// # Arguments
    ///
    /// * `seed` - Noise generator seed
    /// * `samples_per_day` - Ticks in one simulated day
    /// * `battery_dmv` - Initial battery voltage in 0.1 mV units
    /// * `drain_dmv` - Battery drop per measurement
    pub fn new(seed: u64, samples_per_day: u64, battery_dmv: u16, drain_dmv: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            samples: 0,
            samples_per_day: samples_per_day.max(1),
            base_w: 300.0,
            swing_w: 250.0,
            battery_dmv: f64::from(battery_dmv),
            drain_dmv,
        }
    }
}

#[async_trait]
impl Sampler for SyntheticSampler {
    async fn read_battery(&mut self) -> Result<u16> {
        self.battery_dmv = (self.battery_dmv - self.drain_dmv).max(0.0);
        Ok(self.battery_dmv as u16)
    }

    async fn sample_power(&mut self) -> Result<f32> {
        let phase = (self.samples % self.samples_per_day) as f64 / self.samples_per_day as f64;
        self.samples += 1;
        let noise: f64 = self.rng.gen_range(-20.0..20.0);
        let watts = self.base_w + self.swing_w * (2.0 * PI * phase).sin() + noise;
        Ok(watts.max(0.0) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_power_never_yields_erased_code() {
        assert_eq!(scale_power(f32::MAX), MAX_POWER_CODE);
        assert_eq!(scale_power(f32::INFINITY), MAX_POWER_CODE);
        assert_eq!(scale_power(13_107.0), MAX_POWER_CODE);
        assert_ne!(scale_power(13_106.9), u16::MAX);
    }

    #[test]
    fn test_scale_power_rounds_to_units() {
        assert_eq!(scale_power(0.0), 0);
        assert_eq!(scale_power(0.09), 0);
        assert_eq!(scale_power(0.11), 1);
        assert_eq!(scale_power(f32::NAN), 0);
    }

    #[tokio::test]
    async fn test_synthetic_sampler_is_seeded() {
        let mut a = SyntheticSampler::new(5, 100, 40_000, 1.0);
        let mut b = SyntheticSampler::new(5, 100, 40_000, 1.0);
        for _ in 0..10 {
            assert_eq!(a.sample_power().await.unwrap(), b.sample_power().await.unwrap());
        }
        assert_eq!(a.read_battery().await.unwrap(), 39_999);
        assert_eq!(a.read_battery().await.unwrap(), 39_998);
    }

    #[tokio::test]
    async fn test_synthetic_power_stays_positive() {
        let mut sampler = SyntheticSampler::new(1, 24, 40_000, 0.0);
        for _ in 0..48 {
            assert!(sampler.sample_power().await.unwrap() >= 0.0);
        }
    }
}
