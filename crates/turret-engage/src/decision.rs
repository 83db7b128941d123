use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use turret_proto::{Command, SystemTelemetry};
use turret_safety::{SafetyDenial, SafetySupervisor};
use turret_vision::{ColorClass, LockState, Track};

use crate::mode::FireAuthority;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AimConfig {
    /// Camera field of view, degrees; with the frame size this gives
    /// the image-to-angle calibration.
    pub fov_h_deg: f64,
    pub fov_v_deg: f64,
    pub frame_w: f64,
    pub frame_h: f64,

    /// Angular error below this on both axes counts as on-target.
    pub lock_tolerance_deg: f64,
    /// Consecutive in-tolerance time required for a lock.
    pub lock_hold_ms: u64,
    /// Deltas below this are not re-sent.
    pub deadband_deg: f64,

    /// Reported position older than this suspends motor commands.
    pub stale_after_ms: u64,

    /// Upper bound handed to the firmware with every laser-on; the
    /// firmware turns the laser off autonomously after it elapses.
    pub fire_duration_s: f64,
    /// Minimum time between shots.
    pub cooldown_ms: u64,
    pub motor_speed: u8,
}

impl Default for AimConfig {
    fn default() -> Self {
        Self {
            fov_h_deg: 48.0,
            fov_v_deg: 36.0,
            frame_w: 480.0,
            frame_h: 360.0,
            lock_tolerance_deg: 2.0,
            lock_hold_ms: 300,
            deadband_deg: 0.1,
            stale_after_ms: 2000,
            fire_duration_s: 2.0,
            cooldown_ms: 2000,
            motor_speed: 50,
        }
    }
}

/// Why this cycle did not fire. Informational, surfaced as state, not
/// an operator-facing error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HoldReason {
    #[error("no eligible target")]
    NoTarget,
    #[error("reported position stale, link degraded")]
    StaleTelemetry,
    #[error("safety: {0}")]
    Safety(#[from] SafetyDenial),
    #[error("target not locked")]
    NotLocked,
    #[error("post-fire cooldown")]
    Cooldown,
    #[error("awaiting operator fire command")]
    AwaitingOperator,
    #[error("friendly-class target")]
    FriendlyTarget,
    #[error("mode does not authorize fire")]
    NotAuthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleDecision {
    pub target_id: Option<u64>,
    pub lock: LockState,
    pub motor: Option<Command>,
    pub laser: Option<Command>,
    pub hold: Option<HoldReason>,
    /// Advisory only (manual-mode friendly target).
    pub warning: Option<String>,
}

impl CycleDecision {
    fn hold(target_id: Option<u64>, lock: LockState, reason: HoldReason) -> Self {
        Self { target_id, lock, motor: None, laser: None, hold: Some(reason), warning: None }
    }
}

/// Converts the highest-priority eligible track into motor and laser
/// intents. Stateful only for lock streaks and the fire cooldown.
#[derive(Debug)]
pub struct DecisionEngine {
    cfg: AimConfig,
    lock_target: Option<u64>,
    in_tol_since: Option<Instant>,
    last_fire: Option<Instant>,
}

impl DecisionEngine {
    pub fn new(cfg: AimConfig) -> Self {
        Self { cfg, lock_target: None, in_tol_since: None, last_fire: None }
    }

    fn reset_streak(&mut self) {
        self.lock_target = None;
        self.in_tol_since = None;
    }

    fn lock_state(&self, now: Instant) -> LockState {
        match self.in_tol_since {
            None => LockState::Unlocked,
            Some(t0) if now.duration_since(t0) >= Duration::from_millis(self.cfg.lock_hold_ms) => {
                LockState::Locked
            }
            Some(_) => LockState::Acquiring,
        }
    }

    /// One control cycle. `eligible` comes from the mode machine,
    /// highest priority first; the returned lock state is written back
    /// to the tracker by the caller.
    pub fn evaluate(
        &mut self,
        eligible: &[&Track],
        authority: FireAuthority,
        fire_requested: bool,
        telemetry: &SystemTelemetry,
        safety: &SafetySupervisor,
        now: Instant,
    ) -> CycleDecision {
        let Some(target) = eligible.first() else {
            // Hold: no new commands, current aim is kept.
            self.reset_streak();
            return CycleDecision::hold(None, LockState::Unlocked, HoldReason::NoTarget);
        };

        if self.lock_target != Some(target.id) {
            self.lock_target = Some(target.id);
            self.in_tol_since = None;
        }

        if telemetry.is_stale(now, Duration::from_millis(self.cfg.stale_after_ms)) {
            // Blind: no motor commands, never fire. Alignment cannot be
            // verified either, so the streak restarts on recovery.
            self.in_tol_since = None;
            return CycleDecision::hold(
                Some(target.id),
                LockState::Unlocked,
                HoldReason::StaleTelemetry,
            );
        }

        let err_h = (f64::from(target.cx) - self.cfg.frame_w / 2.0)
            * (self.cfg.fov_h_deg / self.cfg.frame_w);
        let err_v = (f64::from(target.cy) - self.cfg.frame_h / 2.0)
            * (self.cfg.fov_v_deg / self.cfg.frame_h);

        let in_tolerance =
            err_h.abs() <= self.cfg.lock_tolerance_deg && err_v.abs() <= self.cfg.lock_tolerance_deg;
        if in_tolerance {
            if self.in_tol_since.is_none() {
                self.in_tol_since = Some(now);
            }
        } else {
            self.in_tol_since = None;
        }
        let lock = self.lock_state(now);

        let motor = if err_h.abs() < self.cfg.deadband_deg && err_v.abs() < self.cfg.deadband_deg {
            None
        } else {
            match safety.permit_motor() {
                Ok(()) => {
                    let (h, v) = safety.clamp_target(
                        telemetry.horizontal_pos + err_h,
                        telemetry.vertical_pos + err_v,
                    );
                    Some(Command::Motor {
                        horizontal: Some(h),
                        vertical: Some(v),
                        speed: Some(self.cfg.motor_speed),
                    })
                }
                Err(denial) => {
                    debug!(%denial, "decision: motor held");
                    None
                }
            }
        };

        let mut warning = None;
        if authority == FireAuthority::OperatorOnly && target.color == ColorClass::Friendly {
            // Manual mode: advisory only, the operator owns the trigger.
            warning = Some(format!("track {} classified friendly", target.id));
        }

        let fire_check = self.check_fire(target, authority, fire_requested, lock, safety, now);
        let (laser, hold) = match fire_check {
            Ok(()) => {
                info!(track = target.id, duration_s = self.cfg.fire_duration_s, "decision: fire");
                self.last_fire = Some(now);
                self.in_tol_since = None;
                (
                    Some(Command::Laser {
                        state: true,
                        duration: Some(self.cfg.fire_duration_s),
                    }),
                    None,
                )
            }
            Err(reason) => (None, Some(reason)),
        };

        CycleDecision { target_id: Some(target.id), lock, motor, laser, hold, warning }
    }

    fn check_fire(
        &self,
        target: &Track,
        authority: FireAuthority,
        fire_requested: bool,
        lock: LockState,
        safety: &SafetySupervisor,
        now: Instant,
    ) -> Result<(), HoldReason> {
        match authority {
            FireAuthority::Denied => return Err(HoldReason::NotAuthorized),
            FireAuthority::OperatorOnly => {
                if !fire_requested {
                    return Err(HoldReason::AwaitingOperator);
                }
            }
            FireAuthority::Autonomous => {
                if target.color == ColorClass::Friendly {
                    return Err(HoldReason::FriendlyTarget);
                }
            }
        }
        if lock != LockState::Locked {
            return Err(HoldReason::NotLocked);
        }
        if let Some(t) = self.last_fire {
            if now.duration_since(t) < Duration::from_millis(self.cfg.cooldown_ms) {
                return Err(HoldReason::Cooldown);
            }
        }
        safety.permit_laser()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turret_safety::SafetyConfig;
    use turret_vision::TargetShape;

    fn track_at(id: u64, cx: f32, cy: f32, color: ColorClass) -> Track {
        Track {
            id,
            cx,
            cy,
            w: 40.0,
            h: 40.0,
            color,
            shape: Some(TargetShape::Circle),
            conf: 0.9,
            age: 10,
            miss: 0,
            hits: 10,
            priority: 1.0,
            lock: LockState::Unlocked,
            recent_colors: vec![color],
        }
    }

    fn fresh_telemetry(now: Instant) -> SystemTelemetry {
        SystemTelemetry { last_update: Some(now), ..SystemTelemetry::default() }
    }

    fn safety() -> SafetySupervisor {
        SafetySupervisor::new(SafetyConfig::default())
    }

    #[test]
    fn hostile_at_crosshair_locks_and_fires_exactly_once() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let target = track_at(1, 240.0, 180.0, ColorClass::Hostile);

        let mut fired = 0;
        let mut seen = vec![];
        for frame in 0..10 {
            let now = t0 + Duration::from_millis(100 * frame);
            let telemetry = fresh_telemetry(now);
            let d = eng.evaluate(
                &[&target],
                FireAuthority::Autonomous,
                false,
                &telemetry,
                &safety,
                now,
            );
            seen.push(d.lock);
            if let Some(Command::Laser { state: true, duration }) = d.laser {
                assert_eq!(duration, Some(2.0));
                fired += 1;
            }
        }
        assert_eq!(fired, 1, "one bounded-duration shot while locked");
        assert_eq!(seen[0], LockState::Acquiring);
        assert!(seen.contains(&LockState::Locked));
    }

    #[test]
    fn out_of_tolerance_frame_resets_the_streak() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let centered = track_at(1, 240.0, 180.0, ColorClass::Hostile);
        let offset = track_at(1, 400.0, 180.0, ColorClass::Hostile);

        let telemetry = fresh_telemetry(t0);
        eng.evaluate(&[&centered], FireAuthority::Autonomous, false, &telemetry, &safety, t0);

        let now = t0 + Duration::from_millis(200);
        let telemetry = fresh_telemetry(now);
        let d = eng.evaluate(&[&offset], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert_eq!(d.lock, LockState::Unlocked);

        // Back in tolerance: the hold window starts over.
        let now = t0 + Duration::from_millis(400);
        let telemetry = fresh_telemetry(now);
        let d =
            eng.evaluate(&[&centered], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert_eq!(d.lock, LockState::Acquiring);
        assert_eq!(d.hold, Some(HoldReason::NotLocked));
    }

    #[test]
    fn motor_delta_uses_fov_calibration_and_deadband() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let now = Instant::now();
        let telemetry = fresh_telemetry(now);

        // 48 deg over 480 px = 0.1 deg/px; 100 px right of center.
        let target = track_at(1, 340.0, 180.0, ColorClass::Hostile);
        let d = eng.evaluate(&[&target], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        match d.motor {
            Some(Command::Motor { horizontal: Some(h), vertical: Some(v), speed: Some(50) }) => {
                assert!((h - 10.0).abs() < 1e-6);
                assert!((v - 0.0).abs() < 1e-6);
            }
            other => panic!("expected motor command, got {:?}", other),
        }

        // Sub-deadband error: command suppressed.
        let near = track_at(1, 240.5, 180.0, ColorClass::Hostile);
        let d = eng.evaluate(&[&near], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert!(d.motor.is_none());
    }

    #[test]
    fn stale_telemetry_suspends_motors_and_never_fires() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let target = track_at(1, 240.0, 180.0, ColorClass::Hostile);

        let telemetry = fresh_telemetry(t0);
        let now = t0 + Duration::from_secs(3);
        let d = eng.evaluate(&[&target], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert_eq!(d.hold, Some(HoldReason::StaleTelemetry));
        assert!(d.motor.is_none());
        assert!(d.laser.is_none());
    }

    #[test]
    fn manual_mode_fires_only_on_operator_request() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let target = track_at(1, 240.0, 180.0, ColorClass::Hostile);

        // Hold long enough to lock, without a fire request.
        for frame in 0..5 {
            let now = t0 + Duration::from_millis(100 * frame);
            let telemetry = fresh_telemetry(now);
            let d = eng.evaluate(
                &[&target],
                FireAuthority::OperatorOnly,
                false,
                &telemetry,
                &safety,
                now,
            );
            assert!(d.laser.is_none());
        }

        let now = t0 + Duration::from_millis(600);
        let telemetry = fresh_telemetry(now);
        let d =
            eng.evaluate(&[&target], FireAuthority::OperatorOnly, true, &telemetry, &safety, now);
        assert!(matches!(d.laser, Some(Command::Laser { state: true, .. })));
    }

    #[test]
    fn manual_friendly_target_warns_but_does_not_block() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let friendly = track_at(1, 240.0, 180.0, ColorClass::Friendly);

        for frame in 0..5 {
            let now = t0 + Duration::from_millis(100 * frame);
            let telemetry = fresh_telemetry(now);
            eng.evaluate(&[&friendly], FireAuthority::OperatorOnly, false, &telemetry, &safety, now);
        }
        let now = t0 + Duration::from_millis(600);
        let telemetry = fresh_telemetry(now);
        let d =
            eng.evaluate(&[&friendly], FireAuthority::OperatorOnly, true, &telemetry, &safety, now);
        assert!(d.warning.is_some());
        assert!(d.laser.is_some());
    }

    #[test]
    fn autonomous_fire_refuses_friendly_targets() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let t0 = Instant::now();
        let friendly = track_at(1, 240.0, 180.0, ColorClass::Friendly);

        for frame in 0..6 {
            let now = t0 + Duration::from_millis(100 * frame);
            let telemetry = fresh_telemetry(now);
            let d = eng.evaluate(
                &[&friendly],
                FireAuthority::Autonomous,
                false,
                &telemetry,
                &safety,
                now,
            );
            assert!(d.laser.is_none());
            if d.lock == LockState::Locked {
                assert_eq!(d.hold, Some(HoldReason::FriendlyTarget));
            }
        }
    }

    #[test]
    fn latched_estop_suppresses_both_intents() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let mut safety = safety();
        safety.latch_estop();
        let now = Instant::now();
        let telemetry = fresh_telemetry(now);
        let target = track_at(1, 340.0, 180.0, ColorClass::Hostile);

        let d = eng.evaluate(&[&target], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert!(d.motor.is_none());
        assert!(d.laser.is_none());
    }

    #[test]
    fn no_eligible_target_is_a_hold_not_a_reset() {
        let mut eng = DecisionEngine::new(AimConfig::default());
        let safety = safety();
        let now = Instant::now();
        let telemetry = fresh_telemetry(now);
        let d = eng.evaluate(&[], FireAuthority::Autonomous, false, &telemetry, &safety, now);
        assert_eq!(d.hold, Some(HoldReason::NoTarget));
        assert!(d.motor.is_none());
        assert!(d.target_id.is_none());
    }
}
