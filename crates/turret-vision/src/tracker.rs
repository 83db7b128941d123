use tracing::debug;

use crate::{ColorClass, Detection, TargetShape};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub frame_w: f32,
    pub frame_h: f32,

    /// Association gate: a detection further than this (pixels) from a
    /// track center never matches it.
    pub gate_px: f32,

    /// Position smoothing factor, weight of the new detection.
    pub pos_alpha: f32,
    /// Confidence smoothing factor.
    pub conf_alpha: f32,

    /// A track missed for more than this many consecutive frames is
    /// dropped (~0.5 s at the detector frame rate).
    pub max_misses: u32,
    pub max_tracks: usize,

    /// How many recent detections vote on the track color.
    pub color_votes: usize,

    // Priority weights. Tunable policy; only the ordering contract
    // (total order, ties to the lowest id) is structural.
    pub w_center: f32,
    pub w_conf: f32,
    pub w_color: f32,
    pub w_age: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            frame_w: 640.0,
            frame_h: 480.0,
            gate_px: 60.0,
            pos_alpha: 0.6,
            conf_alpha: 0.3,
            max_misses: 15,
            max_tracks: 16,
            color_votes: 9,
            w_center: 1.0,
            w_conf: 0.5,
            w_color: 1.5,
            w_age: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub color: ColorClass,
    pub shape: Option<TargetShape>,
    pub conf: f32,
    pub age: u32,
    pub miss: u32,
    pub hits: u32,
    pub priority: f32,
    pub lock: LockState,

    /// Recent per-detection color votes backing the majority vote.
    pub recent_colors: Vec<ColorClass>,
}

impl Track {
    fn vote_color(&mut self, seen: ColorClass, window: usize) {
        self.recent_colors.push(seen);
        let len = self.recent_colors.len();
        if len > window.max(1) {
            self.recent_colors.drain(..len - window.max(1));
        }
        let mut counts = [0usize; 3];
        for c in &self.recent_colors {
            let i = match c {
                ColorClass::Friendly => 0,
                ColorClass::Hostile => 1,
                ColorClass::Unknown => 2,
            };
            counts[i] += 1;
        }
        // Majority vote; ties keep the current class.
        let best = counts.iter().copied().max().unwrap_or(0);
        let current = match self.color {
            ColorClass::Friendly => counts[0],
            ColorClass::Hostile => counts[1],
            ColorClass::Unknown => counts[2],
        };
        if current < best {
            self.color = if counts[0] == best {
                ColorClass::Friendly
            } else if counts[1] == best {
                ColorClass::Hostile
            } else {
                ColorClass::Unknown
            };
        }
    }
}

/// Turns per-frame detections into identity-stable tracks via greedy
/// nearest-neighbour association. Sole writer of track state.
#[derive(Debug)]
pub struct Tracker {
    cfg: TrackerConfig,
    next_id: u64,
    tracks: Vec<Track>,
    dropped_detections: u64,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self { cfg, next_id: 1, tracks: vec![], dropped_detections: 0 }
    }

    /// Malformed-input counter (negative/non-finite detections).
    pub fn dropped_detections(&self) -> u64 {
        self.dropped_detections
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Lock transitions are decided by the decision engine; it writes
    /// them back here so snapshots stay consistent.
    pub fn set_lock(&mut self, id: u64, lock: LockState) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.id == id) {
            t.lock = lock;
        }
    }

    /// One frame: associate, update, spawn, prune, reprioritize.
    /// `preferred_color` is the current mode's eligible class, feeding
    /// the priority score only.
    pub fn update(
        &mut self,
        detections: &[Detection],
        preferred_color: Option<ColorClass>,
    ) -> Vec<Track> {
        let before = detections.len();
        let dets: Vec<&Detection> =
            detections.iter().filter(|d| d.is_well_formed()).collect();
        let dropped = (before - dets.len()) as u64;
        if dropped > 0 {
            self.dropped_detections += dropped;
            debug!(dropped, "tracker: malformed detections filtered");
        }

        for t in &mut self.tracks {
            t.age += 1;
            t.miss += 1;
        }

        // Greedy association: each track takes the closest unclaimed
        // detection inside the gate.
        let mut used = vec![false; dets.len()];
        for t in &mut self.tracks {
            let mut best: Option<(usize, f32)> = None;
            for (i, d) in dets.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let dist = ((d.cx - t.cx).powi(2) + (d.cy - t.cy).powi(2)).sqrt();
                if dist > self.cfg.gate_px {
                    continue;
                }
                if best.map(|(_, bd)| dist < bd).unwrap_or(true) {
                    best = Some((i, dist));
                }
            }
            if let Some((i, _)) = best {
                used[i] = true;
                let d = dets[i];
                let a = self.cfg.pos_alpha;
                t.cx = a * d.cx + (1.0 - a) * t.cx;
                t.cy = a * d.cy + (1.0 - a) * t.cy;
                t.w = a * d.w + (1.0 - a) * t.w;
                t.h = a * d.h + (1.0 - a) * t.h;
                let ca = self.cfg.conf_alpha;
                t.conf = ca * d.conf.min(1.0) + (1.0 - ca) * t.conf;
                t.vote_color(d.color, self.cfg.color_votes);
                if d.shape.is_some() {
                    t.shape = d.shape;
                }
                t.hits += 1;
                t.miss = 0;
            }
        }

        for (i, d) in dets.iter().enumerate() {
            if used[i] {
                continue;
            }
            if self.tracks.len() >= self.cfg.max_tracks {
                break;
            }
            self.tracks.push(Track {
                id: self.next_id,
                cx: d.cx,
                cy: d.cy,
                w: d.w,
                h: d.h,
                color: d.color,
                shape: d.shape,
                conf: d.conf.min(1.0),
                age: 1,
                miss: 0,
                hits: 1,
                priority: 0.0,
                lock: LockState::Unlocked,
                recent_colors: vec![d.color],
            });
            self.next_id += 1;
        }

        let max_misses = self.cfg.max_misses;
        self.tracks.retain(|t| t.miss <= max_misses);

        self.reprioritize(preferred_color);
        self.tracks.clone()
    }

    fn reprioritize(&mut self, preferred_color: Option<ColorClass>) {
        let half_diag = (self.cfg.frame_w.powi(2) + self.cfg.frame_h.powi(2)).sqrt() / 2.0;
        let (ccx, ccy) = (self.cfg.frame_w / 2.0, self.cfg.frame_h / 2.0);
        for t in &mut self.tracks {
            let dist = ((t.cx - ccx).powi(2) + (t.cy - ccy).powi(2)).sqrt();
            let centrality = 1.0 - (dist / half_diag).min(1.0);
            let color_bonus = match preferred_color {
                Some(c) if c == t.color => 1.0,
                Some(_) => 0.0,
                None => 0.5,
            };
            let stability = (t.age.min(30) as f32) / 30.0;
            t.priority = self.cfg.w_center * centrality
                + self.cfg.w_conf * t.conf
                + self.cfg.w_color * color_bonus
                + self.cfg.w_age * stability;
        }
        // Descending priority; equal scores go to the oldest (lowest)
        // id so the ordering is a total order.
        self.tracks.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(cx: f32, cy: f32, color: ColorClass, conf: f32) -> Detection {
        Detection { cx, cy, w: 40.0, h: 40.0, color, conf, shape: None }
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig::default())
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut tr = tracker();
        let ts = tr.update(
            &[det(50.0, 50.0, ColorClass::Hostile, 0.9), det(400.0, 300.0, ColorClass::Friendly, 0.8)],
            None,
        );
        let mut ids: Vec<u64> = ts.iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        // A far-away newcomer gets the next id, never a recycled one.
        let ts = tr.update(
            &[
                det(50.0, 50.0, ColorClass::Hostile, 0.9),
                det(400.0, 300.0, ColorClass::Friendly, 0.8),
                det(200.0, 100.0, ColorClass::Unknown, 0.5),
            ],
            None,
        );
        assert!(ts.iter().any(|t| t.id == 3));
        assert_eq!(ts.len(), 3);
    }

    #[test]
    fn matched_track_keeps_identity_and_smooths_position() {
        let mut tr = tracker();
        tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        let ts = tr.update(&[det(110.0, 100.0, ColorClass::Hostile, 0.9)], None);
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].id, 1);
        // alpha 0.6 toward the new sample
        assert!((ts[0].cx - 106.0).abs() < 1e-3);
        assert_eq!(ts[0].miss, 0);
        assert_eq!(ts[0].hits, 2);
    }

    #[test]
    fn track_removed_after_grace_and_never_reappears() {
        let mut tr = tracker();
        tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        for _ in 0..TrackerConfig::default().max_misses {
            let ts = tr.update(&[], None);
            assert_eq!(ts.len(), 1, "still inside the grace window");
        }
        let ts = tr.update(&[], None);
        assert!(ts.is_empty());

        // Same spot again: new identity.
        let ts = tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        assert_eq!(ts[0].id, 2);
    }

    #[test]
    fn priority_ties_break_to_lowest_id() {
        let mut cfg = TrackerConfig::default();
        // Zero out every weight: all priorities equal.
        cfg.w_center = 0.0;
        cfg.w_conf = 0.0;
        cfg.w_color = 0.0;
        cfg.w_age = 0.0;
        let mut tr = Tracker::new(cfg);
        let ts = tr.update(
            &[det(600.0, 400.0, ColorClass::Hostile, 0.2), det(320.0, 240.0, ColorClass::Hostile, 0.99)],
            Some(ColorClass::Hostile),
        );
        assert_eq!(ts[0].priority, ts[1].priority);
        assert_eq!(ts[0].id, 1);
    }

    #[test]
    fn preferred_color_outranks_centrality() {
        let mut tr = tracker();
        let ts = tr.update(
            &[
                det(320.0, 240.0, ColorClass::Friendly, 0.9), // dead center
                det(500.0, 400.0, ColorClass::Hostile, 0.9),
            ],
            Some(ColorClass::Hostile),
        );
        assert_eq!(ts[0].color, ColorClass::Hostile);
    }

    #[test]
    fn malformed_detections_are_dropped_and_counted() {
        let mut tr = tracker();
        let ts = tr.update(
            &[
                det(100.0, 100.0, ColorClass::Hostile, -0.5),
                det(f32::NAN, 100.0, ColorClass::Hostile, 0.9),
                det(200.0, 200.0, ColorClass::Hostile, 0.9),
            ],
            None,
        );
        assert_eq!(ts.len(), 1);
        assert_eq!(tr.dropped_detections(), 2);
    }

    #[test]
    fn color_follows_majority_vote() {
        let mut tr = tracker();
        tr.update(&[det(100.0, 100.0, ColorClass::Unknown, 0.9)], None);
        for _ in 0..3 {
            tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        }
        let ts = tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        assert_eq!(ts[0].color, ColorClass::Hostile);
    }

    #[test]
    fn lock_writeback_sticks_to_the_track() {
        let mut tr = tracker();
        tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        tr.set_lock(1, LockState::Acquiring);
        let ts = tr.update(&[det(100.0, 100.0, ColorClass::Hostile, 0.9)], None);
        assert_eq!(ts[0].lock, LockState::Acquiring);
    }
}
