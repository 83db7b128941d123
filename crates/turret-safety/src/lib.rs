//! Host-side safety supervisor: emergency-stop latch, thermal
//! hysteresis, restricted-zone clamping and the link-degraded posture.
//! The firmware mirrors these interlocks; this side assumes nothing
//! about the link being alive.

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use turret_proto::{StatusReport, SystemTelemetry};

/// An axis-aligned angular box the turret must not aim into.
/// Horizontal bounds are exclusive so a clamped target sitting on the
/// edge counts as outside.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RestrictedZone {
    pub h_min: f64,
    pub h_max: f64,
    pub v_min: f64,
    pub v_max: f64,
}

impl RestrictedZone {
    pub fn contains(&self, h: f64, v: f64) -> bool {
        h > self.h_min && h < self.h_max && v >= self.v_min && v <= self.v_max
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Laser blocked and fan forced above this temperature.
    pub max_temp_c: f64,
    /// Thermal block clears only below this (hysteresis).
    pub fan_off_temp_c: f64,
    /// Readings outside this window are sensor faults, not trips.
    pub plausible_min_c: f64,
    pub plausible_max_c: f64,
    /// Substituted for implausible readings.
    pub fallback_temp_c: f64,

    /// Total horizontal travel, centered on zero.
    pub horizontal_range_deg: f64,
    /// Vertical travel, from zero up.
    pub vertical_range_deg: f64,
    pub restricted_zones: Vec<RestrictedZone>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_temp_c: 75.0,
            fan_off_temp_c: 65.0,
            plausible_min_c: -50.0,
            plausible_max_c: 100.0,
            fallback_temp_c: 25.0,
            horizontal_range_deg: 270.0,
            vertical_range_deg: 60.0,
            restricted_zones: vec![
                RestrictedZone { h_min: -180.0, h_max: -90.0, v_min: 0.0, v_max: 60.0 },
                RestrictedZone { h_min: 90.0, h_max: 180.0, v_min: 0.0, v_max: 60.0 },
            ],
        }
    }
}

/// Why an actuation permit was refused. Denials are states, not bugs;
/// callers report them and hold.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyDenial {
    #[error("emergency stop latched")]
    EmergencyStop,
    #[error("thermal block active ({0:.1}C)")]
    Thermal(f64),
    #[error("link degraded, conservative posture")]
    LinkDegraded,
}

#[derive(Debug)]
pub struct SafetySupervisor {
    cfg: SafetyConfig,
    estop_latched: bool,
    thermal_block: bool,
    fan_demand: bool,
    link_degraded: bool,
    sensor_faults: u64,
    last_temp_c: f64,
}

impl SafetySupervisor {
    pub fn new(cfg: SafetyConfig) -> Self {
        let fallback = cfg.fallback_temp_c;
        Self {
            cfg,
            estop_latched: false,
            thermal_block: false,
            fan_demand: false,
            link_degraded: false,
            sensor_faults: 0,
            last_temp_c: fallback,
        }
    }

    pub fn sensor_faults(&self) -> u64 {
        self.sensor_faults
    }

    pub fn estop_latched(&self) -> bool {
        self.estop_latched
    }

    pub fn thermal_blocked(&self) -> bool {
        self.thermal_block
    }

    /// True while the supervisor wants the cooling fan running.
    pub fn fan_demand(&self) -> bool {
        self.fan_demand
    }

    pub fn link_degraded(&self) -> bool {
        self.link_degraded
    }

    /// Bridge-reported link posture. While degraded, motors freeze and
    /// the laser is denied.
    pub fn set_link_degraded(&mut self, degraded: bool) {
        if degraded != self.link_degraded {
            if degraded {
                warn!("safety: link degraded, freezing actuation");
            } else {
                info!("safety: link recovered");
            }
        }
        self.link_degraded = degraded;
    }

    /// Ingest one telemetry push. Latches e-stop reported by the
    /// controller and runs the thermal policy.
    pub fn observe_status(&mut self, report: &StatusReport) {
        if report.emergency_stop && !self.estop_latched {
            warn!("safety: emergency stop reported by controller, latching");
            self.estop_latched = true;
        }
        self.observe_temperature(report.temperature);
    }

    /// Same policy applied to a bridge telemetry snapshot.
    pub fn observe_telemetry(&mut self, telemetry: &SystemTelemetry) {
        if telemetry.emergency_stop && !self.estop_latched {
            warn!("safety: emergency stop reported by controller, latching");
            self.estop_latched = true;
        }
        self.observe_temperature(telemetry.temperature);
    }

    /// Sanitize and apply a temperature reading. Implausible values are
    /// substituted with the fallback and counted as sensor faults;
    /// they never trip the thermal block.
    pub fn observe_temperature(&mut self, raw_c: f64) -> f64 {
        let temp = if !raw_c.is_finite()
            || raw_c < self.cfg.plausible_min_c
            || raw_c > self.cfg.plausible_max_c
        {
            self.sensor_faults += 1;
            warn!(reading = raw_c, substituted = self.cfg.fallback_temp_c,
                  "safety: implausible temperature, sensor fault");
            self.cfg.fallback_temp_c
        } else {
            raw_c
        };
        self.last_temp_c = temp;

        if temp > self.cfg.max_temp_c {
            if !self.thermal_block {
                warn!(temp_c = temp, "safety: thermal block engaged");
            }
            self.thermal_block = true;
            self.fan_demand = true;
        } else if temp < self.cfg.fan_off_temp_c {
            if self.thermal_block {
                info!(temp_c = temp, "safety: thermal block cleared");
            }
            self.thermal_block = false;
            self.fan_demand = false;
        }
        // Between the watermarks: hold the current state (hysteresis).
        temp
    }

    /// Host-issued stop, e.g. the operator panic button.
    pub fn latch_estop(&mut self) {
        if !self.estop_latched {
            warn!("safety: emergency stop latched (host)");
        }
        self.estop_latched = true;
    }

    /// Called only after the controller acknowledged `emergency_reset`.
    pub fn estop_reset_succeeded(&mut self) {
        info!("safety: emergency stop reset");
        self.estop_latched = false;
    }

    pub fn permit_motor(&self) -> Result<(), SafetyDenial> {
        if self.estop_latched {
            return Err(SafetyDenial::EmergencyStop);
        }
        if self.link_degraded {
            return Err(SafetyDenial::LinkDegraded);
        }
        Ok(())
    }

    pub fn permit_laser(&self) -> Result<(), SafetyDenial> {
        self.permit_motor()?;
        if self.thermal_block {
            return Err(SafetyDenial::Thermal(self.last_temp_c));
        }
        Ok(())
    }

    /// Clamp a motor target into the travel range, then out of any
    /// restricted zone. Targets are substituted, never rejected.
    pub fn clamp_target(&self, h: f64, v: f64) -> (f64, f64) {
        let half_h = self.cfg.horizontal_range_deg / 2.0;
        let mut h = h.clamp(-half_h, half_h);
        let v = v.clamp(0.0, self.cfg.vertical_range_deg);

        for zone in &self.cfg.restricted_zones {
            if zone.contains(h, v) {
                // Push the horizontal component to the zone edge
                // nearest the home heading.
                let edge = if zone.h_min.abs() <= zone.h_max.abs() {
                    zone.h_min
                } else {
                    zone.h_max
                };
                h = edge.clamp(-half_h, half_h);
            }
        }
        (h, v)
    }
}
