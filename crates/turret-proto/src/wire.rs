use serde::{Deserialize, Serialize};

/// Outgoing command payload, one JSON object per line on the wire.
/// The `type` tag makes unknown command kinds unrepresentable on the
/// host side; the firmware replies with `type=error` for anything it
/// cannot parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Motor {
        #[serde(skip_serializing_if = "Option::is_none")]
        horizontal: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        vertical: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<u8>,
    },
    Laser {
        state: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Fan {
        state: bool,
    },
    Status,
    EmergencyStop {
        stop: bool,
    },
    EmergencyReset,
    CalibrateMotors,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Motor { .. } => CommandKind::Motor,
            Command::Laser { .. } => CommandKind::Laser,
            Command::Fan { .. } => CommandKind::Fan,
            Command::Status => CommandKind::Status,
            Command::EmergencyStop { .. } => CommandKind::EmergencyStop,
            Command::EmergencyReset => CommandKind::EmergencyReset,
            Command::CalibrateMotors => CommandKind::CalibrateMotors,
        }
    }
}

/// Command discriminant, used as the key of the one-pending-per-kind
/// table in the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Motor,
    Laser,
    Fan,
    Status,
    EmergencyStop,
    EmergencyReset,
    CalibrateMotors,
}

/// A command with its correlation id, as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
}

impl CommandFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Acknowledgment for a correlated command. `status` is the firmware's
/// literal string ("success" or an error tag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Periodic controller status push (unsolicited or in reply to a
/// `status` poll). Positions in degrees, temperature in Celsius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub temperature: f64,
    pub horizontal_pos: f64,
    pub vertical_pos: f64,
    pub laser_active: bool,
    pub fan_active: bool,
    pub emergency_stop: bool,
}

/// Unsolicited frames pushed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Push {
    Status(StatusReport),
    StatusMessage { message: String },
    Error { message: String },
}

/// Any inbound line: a typed push, or a bare ack correlated by id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Push(Push),
    Ack(Ack),
}

pub fn parse_line(line: &str) -> Result<Inbound, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_frame_encodes_with_tag_and_id() {
        let frame = CommandFrame {
            id: "cmd-7".into(),
            command: Command::Motor {
                horizontal: Some(12.5),
                vertical: Some(3.0),
                speed: Some(50),
            },
        };
        let json = frame.encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "motor");
        assert_eq!(v["id"], "cmd-7");
        assert_eq!(v["horizontal"], 12.5);
    }

    #[test]
    fn laser_frame_omits_missing_duration() {
        let frame = CommandFrame {
            id: "cmd-1".into(),
            command: Command::Laser { state: false, duration: None },
        };
        let json = frame.encode().unwrap();
        assert!(!json.contains("duration"));
        assert_eq!(serde_json::from_str::<CommandFrame>(&json).unwrap(), frame);
    }

    #[test]
    fn status_push_parses_before_ack() {
        let line = r#"{"type":"status","temperature":31.5,"horizontal_pos":-12.0,"vertical_pos":8.5,"laser_active":false,"fan_active":true,"emergency_stop":false}"#;
        match parse_line(line).unwrap() {
            Inbound::Push(Push::Status(s)) => {
                assert_eq!(s.temperature, 31.5);
                assert!(s.fan_active);
            }
            other => panic!("expected status push, got {:?}", other),
        }
    }

    #[test]
    fn bare_ack_parses_as_ack() {
        let line = r#"{"id":"cmd-3","status":"success","message":"moved"}"#;
        match parse_line(line).unwrap() {
            Inbound::Ack(a) => {
                assert!(a.is_success());
                assert_eq!(a.id, "cmd-3");
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_line("{\"type\":").is_err());
    }
}
