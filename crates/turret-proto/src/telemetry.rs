use std::time::{Duration, Instant};

use crate::wire::StatusReport;

/// Last known controller state, refreshed from status pushes. Owned and
/// written by the link layer; every other component reads snapshots.
#[derive(Debug, Clone)]
pub struct SystemTelemetry {
    pub horizontal_pos: f64,
    pub vertical_pos: f64,
    pub temperature: f64,
    pub laser_active: bool,
    pub fan_active: bool,
    pub emergency_stop: bool,
    pub last_update: Option<Instant>,
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self {
            horizontal_pos: 0.0,
            vertical_pos: 0.0,
            temperature: 0.0,
            laser_active: false,
            fan_active: false,
            emergency_stop: false,
            last_update: None,
        }
    }
}

impl SystemTelemetry {
    pub fn apply(&mut self, report: &StatusReport, now: Instant) {
        self.horizontal_pos = report.horizontal_pos;
        self.vertical_pos = report.vertical_pos;
        self.temperature = report.temperature;
        self.laser_active = report.laser_active;
        self.fan_active = report.fan_active;
        self.emergency_stop = report.emergency_stop;
        self.last_update = Some(now);
    }

    /// Time since the last status push, if any was ever received.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|t| now.saturating_duration_since(t))
    }

    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        match self.age(now) {
            Some(age) => age > max_age,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(temp: f64) -> StatusReport {
        StatusReport {
            temperature: temp,
            horizontal_pos: 1.0,
            vertical_pos: 2.0,
            laser_active: true,
            fan_active: false,
            emergency_stop: false,
        }
    }

    #[test]
    fn apply_refreshes_age() {
        let mut t = SystemTelemetry::default();
        let now = Instant::now();
        assert!(t.is_stale(now, Duration::from_secs(2)));

        t.apply(&report(24.0), now);
        assert_eq!(t.temperature, 24.0);
        assert!(t.laser_active);
        assert!(!t.is_stale(now, Duration::from_secs(2)));

        let later = now + Duration::from_secs(3);
        assert!(t.is_stale(later, Duration::from_secs(2)));
    }
}
