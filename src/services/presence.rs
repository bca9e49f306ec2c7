//! Presence detection from ultrasonic distance samples
//!
//! Each archway carries two MB1040-style sensors. A pallet is present when
//! either sensor reads inside the trigger distance, and gone once every sensor
//! reads beyond the release distance. Samples outside the sensor's usable range
//! are treated as no sample at all.

use crate::domain::types::ArchwayId;
use tracing::debug;

/// MB1040 pulse width scale: 147 µs per inch
const MICROS_PER_INCH: f64 = 147.0;

/// Convert an echo pulse width to inches
#[inline]
pub fn pulse_to_inches(pulse_us: f64) -> f64 {
    pulse_us / MICROS_PER_INCH
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceConfig {
    /// Occupied when any sensor reads at or below this distance
    pub trigger_in: f64,
    /// Clear when every sensor reads above this distance
    pub release_in: f64,
    /// Readings below this are sensor noise
    pub hard_min_in: f64,
    /// Readings above this are out of range
    pub max_in: f64,
    /// Consecutive occupied evaluations needed to report presence
    pub present_samples: u32,
    /// Consecutive clear evaluations needed to report absence
    pub absent_samples: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            trigger_in: 13.0,
            release_in: 20.0,
            hard_min_in: 6.0,
            max_in: 254.0,
            present_samples: 1,
            absent_samples: 2,
        }
    }
}

/// Per-archway presence state machine
#[derive(Debug, Clone)]
pub struct PresenceMonitor {
    archway: ArchwayId,
    config: PresenceConfig,
    /// Latest valid distance per sensor index
    latest: [Option<f64>; 2],
    present: bool,
    streak: u32,
}

impl PresenceMonitor {
    pub fn new(archway: ArchwayId, config: PresenceConfig) -> Self {
        Self { archway, config, latest: [None, None], present: false, streak: 0 }
    }

    pub fn archway(&self) -> ArchwayId {
        self.archway
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Feed one sample; returns the new presence value on a transition
    ///
    /// `distance_in` is `None` when the sensor produced no pulse.
    pub fn on_sample(&mut self, sensor: u8, distance_in: Option<f64>) -> Option<bool> {
        let valid = distance_in
            .filter(|d| d.is_finite() && *d >= self.config.hard_min_in && *d <= self.config.max_in);
        let Some(distance) = valid else {
            debug!(archway = %self.archway, sensor = %sensor, distance_in = ?distance_in, "presence_sample_ignored");
            return None;
        };

        let slot = usize::from(sensor.min(1));
        self.latest[slot] = Some(distance);

        let occupied = self.latest.iter().flatten().any(|&d| d <= self.config.trigger_in);
        let clear = self.latest.iter().flatten().all(|&d| d > self.config.release_in);

        let wants_change = if self.present { clear } else { occupied };
        if !wants_change {
            self.streak = 0;
            return None;
        }

        self.streak += 1;
        let needed = if self.present { self.config.absent_samples } else { self.config.present_samples };
        if self.streak < needed.max(1) {
            return None;
        }

        self.present = !self.present;
        self.streak = 0;
        debug!(archway = %self.archway, present = %self.present, distance_in = %distance, "presence_changed");
        Some(self.present)
    }

    /// Align with presence decided externally
    pub fn force(&mut self, present: bool) {
        self.present = present;
        self.streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PresenceMonitor {
        PresenceMonitor::new(ArchwayId(1), PresenceConfig::default())
    }

    #[test]
    fn test_pulse_conversion() {
        assert!((pulse_to_inches(1470.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_either_sensor_triggers() {
        let mut m = monitor();
        assert_eq!(m.on_sample(0, Some(80.0)), None);
        assert_eq!(m.on_sample(1, Some(12.0)), Some(true));
        assert!(m.is_present());
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut m = monitor();
        assert_eq!(m.on_sample(0, Some(3.0)), None);
        assert_eq!(m.on_sample(0, Some(400.0)), None);
        assert_eq!(m.on_sample(0, None), None);
        assert!(!m.is_present());
    }

    #[test]
    fn test_release_needs_consecutive_clear_samples() {
        let mut m = monitor();
        m.on_sample(0, Some(10.0));
        m.on_sample(1, Some(10.0));
        assert!(m.is_present());

        // Only one sensor clear: still occupied
        assert_eq!(m.on_sample(0, Some(60.0)), None);
        assert_eq!(m.on_sample(1, Some(60.0)), None);
        assert_eq!(m.on_sample(1, Some(61.0)), Some(false));
    }

    #[test]
    fn test_hysteresis_band_holds_state() {
        let mut m = monitor();
        m.on_sample(0, Some(10.0));
        assert!(m.is_present());

        // Between trigger and release: no change however many samples
        for _ in 0..5 {
            assert_eq!(m.on_sample(0, Some(16.0)), None);
        }
        assert!(m.is_present());
    }

    #[test]
    fn test_clear_streak_resets() {
        let mut m = monitor();
        m.on_sample(0, Some(10.0));
        assert_eq!(m.on_sample(0, Some(60.0)), None);
        assert_eq!(m.on_sample(0, Some(16.0)), None);
        assert_eq!(m.on_sample(0, Some(60.0)), None);
        assert_eq!(m.on_sample(0, Some(60.0)), Some(false));
    }
}
