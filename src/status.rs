//! The canonical telemetry snapshot and its normalization.
//!
//! Both transports deliver the same status dictionary the WiFi add-on renders
//! on its status page. Field availability varies per unit family: CVE units
//! report a textual `FanInfo` mode, non-CVE units a numeric `Actual_Mode`, and
//! fields a unit does not have carry the literal string `"not available"`.

use num_traits::FromPrimitive as _;
use serde_json::Value;

use crate::speed::VirtualRemoteCommand;

/// Sentinel the device reports for fields it cannot measure.
pub const NOT_AVAILABLE: &str = "not available";

pub const SPEED_STATUS_KEY: &str = "Speed status";
pub const REQ_FAN_SPEED_KEY: &str = "ReqFanspeed";
pub const FAN_INFO_KEY: &str = "FanInfo";
pub const ACTUAL_MODE_KEY: &str = "Actual_Mode";
pub const CO2_LEVEL_KEY: &str = "CO2level (ppm)";
pub const HUMIDITY_KEY: &str = "hum";
pub const TEMPERATURE_KEY: &str = "temp";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("status payload is not valid JSON")]
    MalformedPayload(#[source] serde_json::Error),
    #[error("status payload is valid JSON but not an object")]
    NotAnObject,
}

/// One normalized telemetry snapshot.
///
/// Constructed fresh for every poll response or MQTT status message and never
/// mutated afterwards. `"not available"` strings are replaced with `null` at
/// construction; all other values pass through exactly as received, including
/// strings that happen to look numeric.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct DeviceStatus {
    fields: serde_json::Map<String, Value>,
}

impl DeviceStatus {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let parsed: Value = serde_json::from_str(raw).map_err(Error::MalformedPayload)?;
        let Value::Object(object) = parsed else {
            return Err(Error::NotAnObject);
        };
        let fields = object
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) if s == NOT_AVAILABLE => (key, Value::Null),
                other => (key, other),
            })
            .collect();
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &serde_json::Map<String, Value> {
        &self.fields
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key)?.as_f64()
    }

    /// The fan's current speed as a 0–100 percentage.
    pub fn speed_status(&self) -> Option<f64> {
        self.number(SPEED_STATUS_KEY)
    }

    /// The speed the unit was asked to reach, in rpm.
    pub fn requested_fan_speed(&self) -> Option<f64> {
        self.number(REQ_FAN_SPEED_KEY)
    }

    pub fn co2_ppm(&self) -> Option<f64> {
        self.number(CO2_LEVEL_KEY)
    }

    pub fn humidity(&self) -> Option<f64> {
        self.number(HUMIDITY_KEY)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.number(TEMPERATURE_KEY)
    }

    /// CVE units report the discrete operating mode as `FanInfo`.
    pub fn fan_info(&self) -> Option<FanInfo> {
        let value = self.fields.get(FAN_INFO_KEY)?;
        match value {
            Value::String(s) => Some(FanInfo::from_reported(s)),
            // Some firmware versions report the numeric selection here.
            Value::Number(n) => Some(
                n.as_u64()
                    .map_or(FanInfo::Medium, |n| FanInfo::from_reported(&n.to_string())),
            ),
            _ => None,
        }
    }

    /// Non-CVE units report a numeric mode enumeration instead of `FanInfo`.
    pub fn actual_mode(&self) -> Option<ActualMode> {
        let value = self.fields.get(ACTUAL_MODE_KEY)?.as_u64()?;
        // Anything outside the documented enumeration counts as medium, the
        // device's resting state.
        Some(ActualMode::from_u64(value).unwrap_or(ActualMode::Medium))
    }

    /// The discrete operating level, as a virtual remote command, regardless
    /// of unit family. `None` when neither family's field is present.
    pub fn fan_mode(&self) -> Option<VirtualRemoteCommand> {
        if let Some(info) = self.fan_info() {
            return Some(info.into());
        }
        self.actual_mode().map(Into::into)
    }

    pub fn air_quality(&self) -> AirQuality {
        AirQuality::from_co2_ppm(self.co2_ppm())
    }
}

/// Discrete operating mode a CVE unit reports.
///
/// The numeric spellings `"1"`/`"2"`/`"3"` appear on some firmware versions
/// and alias low/medium/high.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FanInfo {
    Auto,
    Low,
    Medium,
    High,
}

impl FanInfo {
    /// Parses the reported string, treating anything unrecognized as medium.
    pub fn from_reported(value: &str) -> Self {
        match value {
            "1" => FanInfo::Low,
            "2" => FanInfo::Medium,
            "3" => FanInfo::High,
            other => other.parse().unwrap_or(FanInfo::Medium),
        }
    }
}

impl From<FanInfo> for VirtualRemoteCommand {
    fn from(info: FanInfo) -> Self {
        match info {
            FanInfo::Low => VirtualRemoteCommand::Low,
            // Auto idles at the same point of the scale as medium.
            FanInfo::Medium | FanInfo::Auto => VirtualRemoteCommand::Medium,
            FanInfo::High => VirtualRemoteCommand::High,
        }
    }
}

/// Discrete operating mode a non-CVE unit reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ActualMode {
    Low = 1,
    Medium = 2,
    High = 3,
    Auto = 24,
}

impl From<ActualMode> for VirtualRemoteCommand {
    fn from(mode: ActualMode) -> Self {
        match mode {
            ActualMode::Low => VirtualRemoteCommand::Low,
            ActualMode::Medium | ActualMode::Auto => VirtualRemoteCommand::Medium,
            ActualMode::High => VirtualRemoteCommand::High,
        }
    }
}

/// Air quality classification derived from the CO2 concentration.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::VariantNames, serde::Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AirQuality {
    Unknown,
    Excellent,
    Good,
    Fair,
    Inferior,
    Poor,
}

impl AirQuality {
    pub fn from_co2_ppm(ppm: Option<f64>) -> Self {
        let Some(ppm) = ppm else {
            return AirQuality::Unknown;
        };
        if ppm <= 350.0 {
            AirQuality::Excellent
        } else if ppm <= 1000.0 {
            AirQuality::Good
        } else if ppm <= 1600.0 {
            AirQuality::Fair
        } else if ppm <= 2000.0 {
            AirQuality::Inferior
        } else {
            AirQuality::Poor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(value: Value) -> DeviceStatus {
        DeviceStatus::from_json(&value.to_string()).expect("valid payload")
    }

    #[test]
    fn not_available_becomes_absent() {
        let status = status(json!({
            "temp": 21.5,
            "hum": "not available",
            "FanInfo": "low",
        }));
        assert_eq!(status.temperature(), Some(21.5));
        assert_eq!(status.humidity(), None);
        assert_eq!(status.fields().get("hum"), Some(&Value::Null));
    }

    #[test]
    fn other_values_pass_through_unconverted() {
        let status = status(json!({ "Speed status": "45", "SpeedCap": 254 }));
        // Stray numeric strings are preserved, not coerced.
        assert_eq!(status.fields().get("Speed status"), Some(&json!("45")));
        assert_eq!(status.speed_status(), None);
        assert_eq!(status.number("SpeedCap"), Some(254.0));
    }

    #[test]
    fn normalization_is_idempotent() {
        let first = status(json!({
            "temp": "not available",
            "hum": 45.0,
            "FanInfo": "auto",
        }));
        let serialized = serde_json::to_string(&first).expect("serializable");
        let second = DeviceStatus::from_json(&serialized).expect("valid payload");
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            DeviceStatus::from_json("{ not json"),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(DeviceStatus::from_json("[1, 2]"), Err(Error::NotAnObject)));
    }

    #[test]
    fn fan_info_parses_every_reported_spelling() {
        for (reported, expected) in [
            (json!("low"), FanInfo::Low),
            (json!("medium"), FanInfo::Medium),
            (json!("high"), FanInfo::High),
            (json!("auto"), FanInfo::Auto),
            (json!("1"), FanInfo::Low),
            (json!("2"), FanInfo::Medium),
            (json!("3"), FanInfo::High),
            (json!("something else"), FanInfo::Medium),
        ] {
            let status = status(json!({ "FanInfo": reported }));
            assert_eq!(status.fan_info(), Some(expected), "{reported:?}");
        }
    }

    #[test]
    fn actual_mode_maps_the_non_cve_enumeration() {
        for (reported, expected) in [
            (1, VirtualRemoteCommand::Low),
            (2, VirtualRemoteCommand::Medium),
            (24, VirtualRemoteCommand::Medium),
            (3, VirtualRemoteCommand::High),
            (7, VirtualRemoteCommand::Medium),
        ] {
            let status = status(json!({ "Actual_Mode": reported }));
            assert_eq!(status.fan_mode(), Some(expected), "mode {reported}");
        }
    }

    #[test]
    fn fan_mode_prefers_fan_info_over_actual_mode() {
        let status = status(json!({ "FanInfo": "high", "Actual_Mode": 1 }));
        assert_eq!(status.fan_mode(), Some(VirtualRemoteCommand::High));
        let absent = status_without_mode();
        assert_eq!(absent.fan_mode(), None);
    }

    fn status_without_mode() -> DeviceStatus {
        status(json!({ "temp": 20.0 }))
    }

    #[test]
    fn air_quality_classification() {
        assert_eq!(AirQuality::from_co2_ppm(None), AirQuality::Unknown);
        assert_eq!(AirQuality::from_co2_ppm(Some(200.0)), AirQuality::Excellent);
        assert_eq!(AirQuality::from_co2_ppm(Some(600.0)), AirQuality::Good);
        assert_eq!(AirQuality::from_co2_ppm(Some(1500.0)), AirQuality::Fair);
        assert_eq!(AirQuality::from_co2_ppm(Some(1999.0)), AirQuality::Inferior);
        assert_eq!(AirQuality::from_co2_ppm(Some(4000.0)), AirQuality::Poor);
    }
}
