use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

/// Alarm level reported by the sensor. The numeric values are part of the
/// wire format in both directions and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(into = "i64", try_from = "i64")]
#[repr(u8)]
pub enum SystemStatus {
    Safe = 0,
    Warning = 1,
    Danger = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStatus(pub i64);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown system status {} (expected 0, 1 or 2)", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl TryFrom<i64> for SystemStatus {
    type Error = UnknownStatus;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SystemStatus::Safe),
            1 => Ok(SystemStatus::Warning),
            2 => Ok(SystemStatus::Danger),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl From<SystemStatus> for i64 {
    fn from(status: SystemStatus) -> Self {
        status as u8 as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorAction {
    Open,
    Close,
}

impl DoorAction {
    /// Literal string published on the command topic.
    pub fn as_command(&self) -> &'static str {
        match self {
            DoorAction::Open => "OPEN",
            DoorAction::Close => "CLOSE",
        }
    }
}

impl FromStr for DoorAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(DoorAction::Open),
            "CLOSE" => Ok(DoorAction::Close),
            other => Err(format!("unknown door action: {other}")),
        }
    }
}

impl fmt::Display for DoorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_command())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReadingResponse {
    pub gas_value: f64,
    pub system_status: SystemStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ReportQuery {
    pub timeframe: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct DoorControlRequest {
    pub action: Option<String>,
}

#[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DoorControlResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_encoded_as_number() {
        let json = serde_json::to_string(&SystemStatus::Danger).unwrap();
        assert_eq!(json, "2");

        let status: SystemStatus = serde_json::from_str("1").unwrap();
        assert_eq!(status, SystemStatus::Warning);
    }

    #[test]
    fn status_outside_enumeration_is_rejected() {
        assert!(serde_json::from_str::<SystemStatus>("3").is_err());
        assert!(serde_json::from_str::<SystemStatus>("-1").is_err());
        assert_eq!(SystemStatus::try_from(7), Err(UnknownStatus(7)));
    }

    #[test]
    fn door_action_parses_only_exact_literals() {
        assert_eq!("OPEN".parse::<DoorAction>(), Ok(DoorAction::Open));
        assert_eq!("CLOSE".parse::<DoorAction>(), Ok(DoorAction::Close));
        assert!("open".parse::<DoorAction>().is_err());
        assert!("FOO".parse::<DoorAction>().is_err());
        assert_eq!(DoorAction::Close.as_command(), "CLOSE");
    }
}
