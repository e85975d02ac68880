use common::req::{SystemStatus, UnknownStatus};

/// Telemetry payload as published by the sensor, e.g.
/// `{"gas_value": 37, "status": 0}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct TelemetryPacket {
    pub gas_value: f64,
    pub status: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Status(#[from] UnknownStatus),
    #[error("gas_value must be a finite number, got {0}")]
    GasValue(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub gas_value: f64,
    pub system_status: SystemStatus,
}

impl TelemetryPacket {
    /// Only a JSON object is a packet; serde would also accept `[37, 1]`.
    pub fn decode(payload: &[u8]) -> Result<Measurement, DecodeError> {
        let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(payload)?;
        let packet: TelemetryPacket = serde_json::from_value(serde_json::Value::Object(fields))?;
        packet.validate()
    }

    fn validate(self) -> Result<Measurement, DecodeError> {
        if !self.gas_value.is_finite() {
            return Err(DecodeError::GasValue(self.gas_value));
        }
        let system_status = SystemStatus::try_from(self.status)?;

        Ok(Measurement {
            gas_value: self.gas_value,
            system_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_device_payload() {
        let m = TelemetryPacket::decode(br#"{"gas_value": 37, "status": 0}"#).unwrap();
        assert_eq!(
            m,
            Measurement {
                gas_value: 37.0,
                system_status: SystemStatus::Safe
            }
        );

        let m = TelemetryPacket::decode(br#"{"status": 2, "gas_value": 812.5}"#).unwrap();
        assert_eq!(m.gas_value, 812.5);
        assert_eq!(m.system_status, SystemStatus::Danger);
    }

    #[test]
    fn rejects_malformed_payloads() {
        let cases: &[&[u8]] = &[
            b"",
            b"not json",
            br#"{"gas_value": 37}"#,
            br#"{"status": 1}"#,
            br#"{"gas_value": "37", "status": 1}"#,
            br#"{"gas_value": 37, "status": "1"}"#,
            br#"{"gas_value": null, "status": 1}"#,
            br#"[37, 1]"#,
            br#"[{"gas_value": 37, "status": 1}]"#,
            b"37",
        ];
        for payload in cases {
            assert!(
                matches!(
                    TelemetryPacket::decode(payload),
                    Err(DecodeError::Malformed(_))
                ),
                "accepted {:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn rejects_status_outside_enumeration() {
        let err = TelemetryPacket::decode(br#"{"gas_value": 37, "status": 3}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Status(UnknownStatus(3))));
    }
}
