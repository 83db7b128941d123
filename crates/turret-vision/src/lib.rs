pub mod tracker;

pub use tracker::{LockState, Track, Tracker, TrackerConfig};

use serde::{Deserialize, Serialize};

/// Color class assigned by the external detector: blue balloons are
/// friendly, red are hostile, anything else is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorClass {
    Friendly,
    Hostile,
    Unknown,
}

/// Target board shape, used to match engagement orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetShape {
    Circle,
    Square,
    Triangle,
}

/// One detector box for one frame. Coordinates are pixels in the camera
/// frame, center + size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub color: ColorClass,
    pub conf: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<TargetShape>,
}

impl Detection {
    /// Detector output is untrusted: negative or non-finite confidence
    /// and non-finite geometry are filtered, not errors.
    pub fn is_well_formed(&self) -> bool {
        self.conf.is_finite()
            && self.conf >= 0.0
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.w.is_finite()
            && self.h.is_finite()
    }
}
