use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use turret_proto::wire::{self, Ack, Command, CommandFrame, CommandKind, Inbound, Push};
use turret_proto::SystemTelemetry;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub serial_dev: Option<String>,
    pub baud: u32,
    /// Missing an ack for this long triggers a retry; a second miss
    /// marks the link degraded.
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    /// Expected cadence of unsolicited status pushes. A silent link is
    /// probed with an explicit poll after this interval.
    pub status_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            serial_dev: None,
            baud: 115_200,
            ack_timeout_ms: 500,
            max_retries: 1,
            status_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link degraded, {0:?} withheld")]
    Degraded(CommandKind),
    #[error("protocol: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Link liveness as seen from the host. Mirrors the controller-status
/// shape the rest of the system reads.
#[derive(Debug, Clone, Default)]
pub struct LinkHealth {
    pub degraded: bool,
    pub last_ack: Option<Instant>,
    pub last_status: Option<Instant>,
    pub ack_timeouts: u64,
    pub protocol_errors: u64,
}

impl LinkHealth {
    pub fn ack_age(&self, now: Instant) -> Option<Duration> {
        self.last_ack.map(|t| now.saturating_duration_since(t))
    }

    pub fn status_age(&self, now: Instant) -> Option<Duration> {
        self.last_status.map(|t| now.saturating_duration_since(t))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    AckOk { kind: CommandKind, id: String },
    AckFailed { kind: CommandKind, id: String, message: Option<String> },
    /// Telemetry snapshot refreshed from a status push.
    StatusUpdated,
    Info(String),
    /// The controller flagged one of our lines as malformed.
    RemoteError(String),
}

#[derive(Debug)]
struct Pending {
    frame: CommandFrame,
    sent_at: Instant,
    retries: u32,
}

/// Pure command/telemetry bridge: correlation, supersession, retry and
/// degraded-link bookkeeping. Does no IO itself; the serial tasks feed
/// it lines and drain its outbox, tests drive it with a fake clock.
#[derive(Debug)]
pub struct Bridge {
    cfg: LinkConfig,
    next_id: u64,
    pending: HashMap<CommandKind, Pending>,
    outbox: Vec<String>,
    telemetry: SystemTelemetry,
    health: LinkHealth,
}

impl Bridge {
    pub fn new(cfg: LinkConfig) -> Self {
        Self {
            cfg,
            next_id: 1,
            pending: HashMap::new(),
            outbox: Vec::new(),
            telemetry: SystemTelemetry::default(),
            health: LinkHealth::default(),
        }
    }

    pub fn telemetry(&self) -> &SystemTelemetry {
        &self.telemetry
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    /// Encoded lines awaiting the serial writer.
    pub fn drain_outbox(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    fn allowed_while_degraded(kind: CommandKind) -> bool {
        matches!(
            kind,
            CommandKind::Status | CommandKind::EmergencyStop | CommandKind::EmergencyReset
        )
    }

    /// Queue a command. A newer intent of the same kind supersedes an
    /// unacknowledged older one instead of queueing behind it.
    pub fn submit(&mut self, command: Command, now: Instant) -> Result<String, LinkError> {
        let kind = command.kind();
        if self.health.degraded && !Self::allowed_while_degraded(kind) {
            return Err(LinkError::Degraded(kind));
        }

        let id = format!("cmd-{}", self.next_id);
        self.next_id += 1;
        let frame = CommandFrame { id: id.clone(), command };

        if let Some(old) = self.pending.remove(&kind) {
            debug!(kind = ?kind, superseded = %old.frame.id, by = %id, "bridge: superseding pending command");
        }
        // Frames are built from our own types; encoding cannot fail.
        let line = frame.encode()?;
        self.outbox.push(line);
        self.pending.insert(kind, Pending { frame, sent_at: now, retries: 0 });
        Ok(id)
    }

    /// Timeout/retry sweep plus the silent-link status poll. Called
    /// once per control cycle.
    pub fn tick(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.cfg.ack_timeout_ms);
        let mut timed_out = Vec::new();
        for (kind, p) in self.pending.iter_mut() {
            if now.saturating_duration_since(p.sent_at) < timeout {
                continue;
            }
            if p.retries < self.cfg.max_retries {
                p.retries += 1;
                p.sent_at = now;
                warn!(kind = ?kind, id = %p.frame.id, retry = p.retries, "bridge: ack timeout, retrying");
                if let Ok(line) = p.frame.encode() {
                    self.outbox.push(line);
                }
            } else {
                timed_out.push(*kind);
            }
        }
        for kind in timed_out {
            let p = self.pending.remove(&kind);
            self.health.ack_timeouts += 1;
            if !self.health.degraded {
                warn!(kind = ?kind, id = ?p.map(|p| p.frame.id), "bridge: repeated ack timeout, link degraded");
            }
            self.health.degraded = true;
        }

        // Silent link: no status inside the expected cadence and no
        // poll already in flight.
        let interval = Duration::from_millis(self.cfg.status_interval_ms);
        let silent = match self.health.last_status {
            Some(t) => now.saturating_duration_since(t) >= interval,
            None => true,
        };
        if silent && !self.pending.contains_key(&CommandKind::Status) {
            debug!("bridge: no status push within cadence, polling");
            // Status polls are always allowed, degraded or not.
            let id = format!("cmd-{}", self.next_id);
            self.next_id += 1;
            let frame = CommandFrame { id, command: Command::Status };
            if let Ok(line) = frame.encode() {
                self.outbox.push(line);
            }
            self.pending.insert(CommandKind::Status, Pending { frame, sent_at: now, retries: 0 });
        }
    }

    /// One inbound line. Malformed lines are discarded with an error
    /// reply and counted; they never touch telemetry or health beyond
    /// the counter.
    pub fn on_line(&mut self, line: &str, now: Instant) -> Result<BridgeEvent, LinkError> {
        if line.trim().is_empty() {
            return Ok(BridgeEvent::Info(String::new()));
        }
        let inbound = match wire::parse_line(line) {
            Ok(v) => v,
            Err(e) => {
                self.health.protocol_errors += 1;
                warn!(line, "bridge: malformed inbound line");
                self.outbox.push(
                    r#"{"type":"error","message":"malformed line"}"#.to_string(),
                );
                return Err(LinkError::Protocol(e));
            }
        };
        match inbound {
            Inbound::Push(Push::Status(report)) => {
                self.telemetry.apply(&report, now);
                // A solicited report is a completed exchange and
                // recovers a degraded link; an unsolicited one only
                // refreshes telemetry.
                if self.pending.remove(&CommandKind::Status).is_some() {
                    self.note_exchange_ok(now);
                }
                self.health.last_status = Some(now);
                Ok(BridgeEvent::StatusUpdated)
            }
            Inbound::Push(Push::StatusMessage { message }) => {
                info!(%message, "controller");
                Ok(BridgeEvent::Info(message))
            }
            Inbound::Push(Push::Error { message }) => {
                warn!(%message, "controller rejected a command");
                Ok(BridgeEvent::RemoteError(message))
            }
            Inbound::Ack(ack) => Ok(self.on_ack(ack, now)),
        }
    }

    fn on_ack(&mut self, ack: Ack, now: Instant) -> BridgeEvent {
        let kind = self
            .pending
            .iter()
            .find(|(_, p)| p.frame.id == ack.id)
            .map(|(k, _)| *k);
        let Some(kind) = kind else {
            // Late ack for a superseded or timed-out command; the
            // controller is alive, which still counts as an exchange.
            debug!(id = %ack.id, "bridge: ack with no pending command");
            self.note_exchange_ok(now);
            return BridgeEvent::Info(format!("late ack {}", ack.id));
        };
        self.pending.remove(&kind);
        self.note_exchange_ok(now);
        if ack.is_success() {
            BridgeEvent::AckOk { kind, id: ack.id }
        } else {
            warn!(kind = ?kind, id = %ack.id, message = ?ack.message, "bridge: command failed");
            BridgeEvent::AckFailed { kind, id: ack.id, message: ack.message }
        }
    }

    fn note_exchange_ok(&mut self, now: Instant) {
        self.health.last_ack = Some(now);
        if self.health.degraded {
            info!("bridge: acknowledgment received, link recovered");
        }
        self.health.degraded = false;
    }
}
