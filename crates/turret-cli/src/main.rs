use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use turret_engage::mode::BoardConfig;
use turret_engage::{AimConfig, DecisionEngine, ModeMachine};
use turret_link::{serial, Bridge, BridgeEvent, LinkConfig};
use turret_proto::wire::{self, Command as WireCommand, CommandFrame, CommandKind, Inbound, Push};
use turret_safety::{SafetyConfig, SafetySupervisor};
use turret_vision::{ColorClass, TargetShape, Track, Tracker, TrackerConfig};

mod detector;
use detector::DetectionSource;

#[derive(Debug, Parser)]
#[command(name = "turret", version, about = "Vision-guided turret engagement controller")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and report obvious wiring problems.
    Doctor,
    /// Run the full control loop.
    Run,
    Link {
        #[command(subcommand)]
        cmd: LinkCmd,
    },
}

#[derive(Debug, Subcommand)]
enum LinkCmd {
    /// Poll the controller once and print its status frame.
    Status,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    mode: ModeCfg,
    #[serde(default)]
    detector: DetectorCfg,
    #[serde(default)]
    control: ControlCfg,
    #[serde(default)]
    tracker: TrackerConfig,
    #[serde(default)]
    aim: AimConfig,
    #[serde(default)]
    boards: BoardConfig,
    #[serde(default)]
    safety: SafetyConfig,
    #[serde(default)]
    link: LinkConfig,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ModeCfg {
    /// "manual" or "automatic"; engagement sessions are started by
    /// operator events at runtime.
    initial: String,
}

impl Default for ModeCfg {
    fn default() -> Self {
        Self { initial: "manual".into() }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct DetectorCfg {
    /// Newline-JSON detection frames (file or FIFO). None runs the
    /// link without vision.
    path: Option<String>,
    frame_hz: f64,
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self { path: None, frame_hz: 30.0 }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ControlCfg {
    /// Command cycles per second, bounding serial traffic.
    cycle_hz: f64,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self { cycle_hz: 10.0 }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

/// Operator/GUI and board-decoder inputs, delivered as text lines on
/// stdin while running.
#[derive(Debug, Clone, PartialEq)]
enum OperatorEvent {
    Manual,
    Automatic,
    Engage(TargetShape, ColorClass),
    Board(String),
    Confirm,
    Fire,
    Estop,
    Reset,
    Calibrate,
    Status,
}

fn parse_operator_line(line: &str) -> Option<OperatorEvent> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "mode" => match words.next()? {
            "manual" => Some(OperatorEvent::Manual),
            "auto" | "automatic" => Some(OperatorEvent::Automatic),
            "engage" => {
                let shape = match words.next()? {
                    "circle" => TargetShape::Circle,
                    "square" => TargetShape::Square,
                    "triangle" => TargetShape::Triangle,
                    _ => return None,
                };
                let color = match words.next()? {
                    "hostile" => ColorClass::Hostile,
                    "friendly" => ColorClass::Friendly,
                    "unknown" => ColorClass::Unknown,
                    _ => return None,
                };
                Some(OperatorEvent::Engage(shape, color))
            }
            _ => None,
        },
        "board" => Some(OperatorEvent::Board(words.next()?.to_string())),
        "confirm" => Some(OperatorEvent::Confirm),
        "fire" => Some(OperatorEvent::Fire),
        "estop" => Some(OperatorEvent::Estop),
        "reset" => Some(OperatorEvent::Reset),
        "calibrate" => Some(OperatorEvent::Calibrate),
        "status" => Some(OperatorEvent::Status),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run => run(&cfg).await,
        Command::Link { cmd: LinkCmd::Status } => link_status(&cfg).await,
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(
        cfg.link.serial_dev.as_ref().map(|s| !s.is_empty()).unwrap_or(false),
        "link.serial_dev missing"
    );
    anyhow::ensure!(cfg.link.baud > 0, "link.baud invalid");
    anyhow::ensure!(cfg.link.ack_timeout_ms > 0, "link.ack_timeout_ms must be positive");

    anyhow::ensure!(
        cfg.safety.fan_off_temp_c < cfg.safety.max_temp_c,
        "safety: fan_off_temp_c must sit below max_temp_c (hysteresis)"
    );
    anyhow::ensure!(
        cfg.safety.plausible_min_c < cfg.safety.plausible_max_c,
        "safety: plausible temperature window is inverted"
    );
    let half_h = cfg.safety.horizontal_range_deg / 2.0;
    for (i, z) in cfg.safety.restricted_zones.iter().enumerate() {
        anyhow::ensure!(z.h_min < z.h_max && z.v_min < z.v_max, "safety: restricted zone {} is inverted", i);
        // Zones may overhang the travel limits (targets are travel-
        // clamped first), but a zone with no overlap at all is a dead
        // config entry.
        anyhow::ensure!(
            z.h_min < half_h
                && z.h_max > -half_h
                && z.v_min < cfg.safety.vertical_range_deg
                && z.v_max > 0.0,
            "safety: restricted zone {} lies entirely outside the travel range",
            i
        );
    }

    anyhow::ensure!(cfg.aim.frame_w > 0.0 && cfg.aim.frame_h > 0.0, "aim: frame size invalid");
    anyhow::ensure!(cfg.aim.fov_h_deg > 0.0 && cfg.aim.fov_v_deg > 0.0, "aim: field of view invalid");
    anyhow::ensure!(
        cfg.aim.deadband_deg < cfg.aim.lock_tolerance_deg,
        "aim: deadband must be tighter than the lock tolerance"
    );
    anyhow::ensure!(cfg.aim.lock_hold_ms > 0, "aim: lock_hold_ms must be positive");

    anyhow::ensure!(cfg.tracker.gate_px > 0.0, "tracker: gate_px must be positive");
    anyhow::ensure!(
        cfg.tracker.pos_alpha > 0.0 && cfg.tracker.pos_alpha <= 1.0,
        "tracker: pos_alpha outside (0,1]"
    );

    match cfg.mode.initial.as_str() {
        "manual" | "auto" | "automatic" => {}
        other => anyhow::bail!("mode.initial: unknown mode {:?}", other),
    }

    if let Some(path) = &cfg.detector.path {
        anyhow::ensure!(std::path::Path::new(path).exists(), "detector.path does not exist: {}", path);
    } else {
        warn!("doctor: no detector.path, run will hold position only");
    }

    info!("doctor: OK");
    Ok(())
}

async fn link_status(cfg: &Config) -> Result<()> {
    let dev = cfg.link.serial_dev.as_ref().context("link.serial_dev missing")?;
    let (mut reader, mut writer) = serial::open(dev, cfg.link.baud)?;

    let frame = CommandFrame { id: "probe-1".into(), command: WireCommand::Status };
    writer.send_line(&frame.encode()?).await?;

    let deadline = Duration::from_secs(2);
    let report = tokio::time::timeout(deadline, async {
        loop {
            match reader.next_line().await? {
                None => anyhow::bail!("controller closed the link"),
                Some(line) => {
                    if let Ok(Inbound::Push(Push::Status(report))) = wire::parse_line(&line) {
                        return Ok(report);
                    }
                }
            }
        }
    })
    .await
    .context("no status reply within 2s")??;

    println!("temperature={:.1}C", report.temperature);
    println!("position h={:.1} v={:.1}", report.horizontal_pos, report.vertical_pos);
    println!("laser_active={}", report.laser_active);
    println!("fan_active={}", report.fan_active);
    println!("emergency_stop={}", report.emergency_stop);
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!(started = %time::OffsetDateTime::now_utc(), "run: starting");

    let supervisor = Arc::new(Mutex::new(SafetySupervisor::new(cfg.safety.clone())));
    let bridge = Arc::new(Mutex::new(Bridge::new(cfg.link.clone())));

    let dev = cfg.link.serial_dev.as_ref().context("link.serial_dev missing")?;
    let (mut serial_rx, mut serial_tx) = serial::open(dev, cfg.link.baud)?;

    // Writer task: the only place that touches the serial TX half.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Err(e) = serial_tx.send_line(&line).await {
                warn!(error = %e, "serial write failed");
            }
        }
    });

    // Reader task: feeds inbound lines into the bridge and routes the
    // safety-relevant events.
    {
        let bridge = bridge.clone();
        let supervisor = supervisor.clone();
        let line_tx = line_tx.clone();
        tokio::spawn(async move {
            loop {
                let line = match serial_rx.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        warn!("serial link closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "serial read failed");
                        break;
                    }
                };
                let now = Instant::now();
                let (event, replies) = {
                    let mut b = bridge.lock().unwrap();
                    let event = b.on_line(&line, now);
                    (event, b.drain_outbox())
                };
                for l in replies {
                    let _ = line_tx.send(l).await;
                }
                match event {
                    Ok(BridgeEvent::StatusUpdated) => {
                        let snapshot = bridge.lock().unwrap().telemetry().clone();
                        supervisor.lock().unwrap().observe_telemetry(&snapshot);
                    }
                    Ok(BridgeEvent::AckOk { kind: CommandKind::EmergencyReset, .. }) => {
                        supervisor.lock().unwrap().estop_reset_succeeded();
                    }
                    Ok(_) | Err(_) => {}
                }
            }
        });
    }

    // Detection frames, latest wins.
    let (frame_tx, mut frame_rx) = watch::channel::<Vec<turret_vision::Detection>>(vec![]);
    if let Some(path) = cfg.detector.path.clone() {
        let frame_period = Duration::from_secs_f64(1.0 / cfg.detector.frame_hz.max(1.0));
        tokio::spawn(async move {
            let mut src = match DetectionSource::open(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "detector source unavailable");
                    return;
                }
            };
            loop {
                match src.next_frame().await {
                    Ok(frame) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "detector source failed");
                        break;
                    }
                }
                tokio::time::sleep(frame_period).await;
            }
        });
    }

    // Operator/board-decoder events from stdin.
    let (op_tx, mut op_rx) = mpsc::channel::<OperatorEvent>(16);
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_operator_line(&line) {
                Some(ev) => {
                    if op_tx.send(ev).await.is_err() {
                        break;
                    }
                }
                None => warn!(line = %line.trim(), "unrecognized operator input"),
            }
        }
    });

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(()).await;
        }
    });

    let mut tracker = Tracker::new(cfg.tracker.clone());
    let mut machine = ModeMachine::new(cfg.boards.clone());
    match cfg.mode.initial.as_str() {
        "auto" | "automatic" => machine.select_automatic(),
        _ => machine.select_manual(),
    }
    let mut engine = DecisionEngine::new(cfg.aim.clone());

    // Home the axes before the first cycle.
    submit(&bridge, &line_tx, WireCommand::CalibrateMotors).await;

    let mut tracks: Vec<Track> = vec![];
    let mut last_board_aim: Option<(f64, f64)> = None;
    let mut last_fan = false;
    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(1.0 / cfg.control.cycle_hz.max(1.0)));

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                warn!("interrupt: issuing emergency stop");
                supervisor.lock().unwrap().latch_estop();
                submit(&bridge, &line_tx, WireCommand::EmergencyStop { stop: true }).await;
                // Give the writer a moment to flush.
                tokio::time::sleep(Duration::from_millis(100)).await;
                break;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();

        // Link posture feeds the safety layer before anything actuates.
        let degraded = bridge.lock().unwrap().health().degraded;
        supervisor.lock().unwrap().set_link_degraded(degraded);

        let mut fire_requested = false;
        while let Ok(ev) = op_rx.try_recv() {
            match ev {
                OperatorEvent::Manual => machine.select_manual(),
                OperatorEvent::Automatic => machine.select_automatic(),
                OperatorEvent::Engage(shape, color) => machine.select_engagement(shape, color),
                OperatorEvent::Board(id) => machine.board_decoded(&id),
                OperatorEvent::Confirm => machine.confirm_engagement(),
                OperatorEvent::Fire => fire_requested = true,
                OperatorEvent::Estop => {
                    supervisor.lock().unwrap().latch_estop();
                    submit(&bridge, &line_tx, WireCommand::EmergencyStop { stop: true }).await;
                }
                OperatorEvent::Reset => {
                    submit(&bridge, &line_tx, WireCommand::EmergencyReset).await;
                }
                OperatorEvent::Calibrate => {
                    submit(&bridge, &line_tx, WireCommand::CalibrateMotors).await;
                }
                OperatorEvent::Status => {
                    let t = bridge.lock().unwrap().telemetry().clone();
                    let s = supervisor.lock().unwrap();
                    info!(
                        mode = ?machine.mode(),
                        tracks = tracks.len(),
                        h = t.horizontal_pos,
                        v = t.vertical_pos,
                        temp_c = t.temperature,
                        estop = s.estop_latched(),
                        degraded = s.link_degraded(),
                        "status"
                    );
                }
            }
        }

        if frame_rx.has_changed().unwrap_or(false) {
            let frame = frame_rx.borrow_and_update().clone();
            tracks = tracker.update(&frame, machine.preferred_color());
        }
        machine.observe_tracks(&tracks);

        // Slew to the board while searching for the order target.
        if let Some(aim) = machine.board_aim() {
            if last_board_aim != Some(aim) && supervisor.lock().unwrap().permit_motor().is_ok() {
                let (h, v) = supervisor.lock().unwrap().clamp_target(aim.0, aim.1);
                submit(
                    &bridge,
                    &line_tx,
                    WireCommand::Motor { horizontal: Some(h), vertical: Some(v), speed: None },
                )
                .await;
                last_board_aim = Some(aim);
            }
        } else {
            last_board_aim = None;
        }

        let eligible = machine.eligible(&tracks);
        let telemetry = bridge.lock().unwrap().telemetry().clone();
        let decision = {
            let sup = supervisor.lock().unwrap();
            engine.evaluate(
                &eligible,
                machine.fire_authority(),
                fire_requested,
                &telemetry,
                &sup,
                now,
            )
        };

        if let Some(id) = decision.target_id {
            tracker.set_lock(id, decision.lock);
        }
        if let Some(w) = &decision.warning {
            warn!(%w, "decision");
        }
        if let Some(hold) = &decision.hold {
            debug!(%hold, "decision: holding fire");
        }
        // The reader task can latch an e-stop from telemetry after the
        // decision was computed; intents are re-checked under a lock
        // taken just before dispatch.
        let (motor, laser) = {
            let sup = supervisor.lock().unwrap();
            gate_intents(&sup, decision.motor, decision.laser)
        };
        if let Some(cmd) = motor {
            submit(&bridge, &line_tx, cmd).await;
        }
        if let Some(cmd) = laser {
            submit(&bridge, &line_tx, cmd).await;
        }

        // Fan follows the thermal policy edge.
        let fan = supervisor.lock().unwrap().fan_demand();
        if fan != last_fan {
            submit(&bridge, &line_tx, WireCommand::Fan { state: fan }).await;
            last_fan = fan;
        }

        let pending_lines = {
            let mut b = bridge.lock().unwrap();
            b.tick(now);
            b.drain_outbox()
        };
        for line in pending_lines {
            let _ = line_tx.send(line).await;
        }
    }

    info!("run: stopped");
    Ok(())
}

/// Last permit check before dispatch. Suppresses intents whose safety
/// precondition lapsed after they were computed.
fn gate_intents(
    safety: &SafetySupervisor,
    motor: Option<WireCommand>,
    laser: Option<WireCommand>,
) -> (Option<WireCommand>, Option<WireCommand>) {
    let motor = motor.filter(|_| safety.permit_motor().is_ok());
    let laser = laser.filter(|_| safety.permit_laser().is_ok());
    (motor, laser)
}

async fn submit(
    bridge: &Arc<Mutex<Bridge>>,
    line_tx: &mpsc::Sender<String>,
    cmd: WireCommand,
) -> Option<String> {
    let (result, lines) = {
        let mut b = bridge.lock().unwrap();
        let result = b.submit(cmd, Instant::now());
        (result, b.drain_outbox())
    };
    for line in lines {
        let _ = line_tx.send(line).await;
    }
    match result {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(error = %e, "command withheld");
            None
        }
    }
}
