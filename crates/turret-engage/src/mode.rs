use serde::Deserialize;
use tracing::{info, warn};

use turret_vision::{ColorClass, TargetShape, Track};

/// Aim presets for the engagement boards, degrees from home.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub board_a_deg: f64,
    pub board_b_deg: f64,
    /// Vertical preset used when slewing to a board.
    pub board_elev_deg: f64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self { board_a_deg: -45.0, board_b_deg: 45.0, board_elev_deg: 30.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementPhase {
    AwaitingBoard,
    AwaitingTarget,
    AwaitingConfirmation,
    Active,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Manual,
    Automatic,
    Engagement(EngagementPhase),
}

/// What the current mode lets the decision engine do with a locked
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAuthority {
    /// No fire in any circumstance (engagement setup phases).
    Denied,
    /// Fire only on an explicit operator fire event (manual mode).
    OperatorOnly,
    /// Fire autonomously once locked.
    Autonomous,
}

/// The single valid target spec for an engagement session. Non-null
/// only while the machine is in an Engagement state.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementOrder {
    pub board: String,
    pub shape: TargetShape,
    pub color: ColorClass,
}

/// Top-level authorization gate. Owns the mode, the engagement order
/// and the engagement target identity; the decision engine only ever
/// acts on tracks this machine exposes.
#[derive(Debug)]
pub struct ModeMachine {
    boards: BoardConfig,
    mode: Mode,
    order: Option<EngagementOrder>,
    /// Shape/color requested by the operator for the session being set
    /// up; folded into the order once the board id arrives.
    requested: Option<(TargetShape, ColorClass)>,
    target_id: Option<u64>,
}

impl ModeMachine {
    pub fn new(boards: BoardConfig) -> Self {
        Self { boards, mode: Mode::Manual, order: None, requested: None, target_id: None }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn order(&self) -> Option<&EngagementOrder> {
        self.order.as_ref()
    }

    pub fn target_id(&self) -> Option<u64> {
        self.target_id
    }

    /// Abrupt mode switch. Cancels any in-flight engagement session and
    /// clears the order.
    pub fn select_manual(&mut self) {
        self.reset_session();
        self.mode = Mode::Manual;
        info!("mode: manual");
    }

    pub fn select_automatic(&mut self) {
        self.reset_session();
        self.mode = Mode::Automatic;
        info!("mode: automatic");
    }

    /// Enter engagement mode with the operator-chosen target spec. The
    /// session starts waiting for the board decoder.
    pub fn select_engagement(&mut self, shape: TargetShape, color: ColorClass) {
        self.reset_session();
        self.requested = Some((shape, color));
        self.mode = Mode::Engagement(EngagementPhase::AwaitingBoard);
        info!(?shape, ?color, "mode: engagement, awaiting board");
    }

    /// Start a fresh session after completion, same target spec flow.
    pub fn restart_session(&mut self) {
        if let Mode::Engagement(EngagementPhase::Complete) = self.mode {
            self.order = None;
            self.target_id = None;
            self.mode = Mode::Engagement(EngagementPhase::AwaitingBoard);
            info!("mode: engagement session restarted");
        }
    }

    fn reset_session(&mut self) {
        if self.order.is_some() || self.target_id.is_some() {
            info!("mode: engagement session cancelled");
        }
        self.order = None;
        self.requested = None;
        self.target_id = None;
    }

    /// Board decoder result. Only meaningful while awaiting a board.
    pub fn board_decoded(&mut self, board_id: &str) {
        let Mode::Engagement(EngagementPhase::AwaitingBoard) = self.mode else {
            return;
        };
        let board = board_id.trim().to_ascii_uppercase();
        if board != "A" && board != "B" {
            warn!(board = %board_id, "mode: unrecognized board id, expecting A or B");
            return;
        }
        let Some((shape, color)) = self.requested else {
            warn!("mode: board decoded but no target spec requested");
            return;
        };
        self.order = Some(EngagementOrder { board: board.clone(), shape, color });
        self.mode = Mode::Engagement(EngagementPhase::AwaitingTarget);
        info!(%board, "mode: board identified, awaiting target");
    }

    /// Where to aim while searching for the order's target.
    pub fn board_aim(&self) -> Option<(f64, f64)> {
        if self.mode != Mode::Engagement(EngagementPhase::AwaitingTarget) {
            return None;
        }
        let order = self.order.as_ref()?;
        let h = if order.board == "A" { self.boards.board_a_deg } else { self.boards.board_b_deg };
        Some((h, self.boards.board_elev_deg))
    }

    fn matches_order(order: &EngagementOrder, track: &Track) -> bool {
        track.color == order.color && track.shape == Some(order.shape)
    }

    /// Observe the current frame's tracks and advance the engagement
    /// phases that depend on them. Called once per control cycle before
    /// the decision engine runs.
    pub fn observe_tracks(&mut self, tracks: &[Track]) {
        match self.mode {
            Mode::Engagement(EngagementPhase::AwaitingTarget) => {
                let Some(order) = self.order.as_ref() else { return };
                if let Some(t) = tracks.iter().find(|t| Self::matches_order(order, t)) {
                    self.target_id = Some(t.id);
                    self.mode = Mode::Engagement(EngagementPhase::AwaitingConfirmation);
                    info!(track = t.id, "mode: order target sighted, awaiting confirmation");
                }
            }
            Mode::Engagement(EngagementPhase::Active) => {
                // Session ends when the engaged track disappears
                // (destroyed or lost).
                if let Some(id) = self.target_id {
                    if !tracks.iter().any(|t| t.id == id) {
                        self.mode = Mode::Engagement(EngagementPhase::Complete);
                        self.order = None;
                        self.target_id = None;
                        info!("mode: engagement complete");
                    }
                }
            }
            _ => {}
        }
    }

    /// Operator confirmation; only advances AwaitingConfirmation.
    pub fn confirm_engagement(&mut self) {
        if self.mode == Mode::Engagement(EngagementPhase::AwaitingConfirmation) {
            self.mode = Mode::Engagement(EngagementPhase::Active);
            info!("mode: engagement confirmed, active");
        }
    }

    /// Tracks the decision engine may act on, highest priority first.
    pub fn eligible<'a>(&self, tracks: &'a [Track]) -> Vec<&'a Track> {
        match self.mode {
            Mode::Manual => tracks.iter().collect(),
            Mode::Automatic => {
                tracks.iter().filter(|t| t.color == ColorClass::Hostile).collect()
            }
            Mode::Engagement(EngagementPhase::Active) => match self.target_id {
                Some(id) => tracks.iter().filter(|t| t.id == id).collect(),
                None => vec![],
            },
            Mode::Engagement(_) => vec![],
        }
    }

    pub fn fire_authority(&self) -> FireAuthority {
        match self.mode {
            Mode::Manual => FireAuthority::OperatorOnly,
            Mode::Automatic => FireAuthority::Autonomous,
            // Once confirmed active, no further human consent is
            // required for the single order-matching target.
            Mode::Engagement(EngagementPhase::Active) => FireAuthority::Autonomous,
            Mode::Engagement(_) => FireAuthority::Denied,
        }
    }

    /// Color class the tracker should bias priority toward.
    pub fn preferred_color(&self) -> Option<ColorClass> {
        match self.mode {
            Mode::Manual => None,
            Mode::Automatic => Some(ColorClass::Hostile),
            Mode::Engagement(_) => self.order.as_ref().map(|o| o.color),
        }
    }
}
