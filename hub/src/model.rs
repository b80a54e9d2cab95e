use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{Error, Result};

/// Gauge full-scale used by the dashboard temperature bar, in °C.
pub const TEMPERATURE_GAUGE_MAX: f64 = 40.0;
/// Upper bound of the pH scale.
pub const PH_MAX: f64 = 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Metrics,
    Controls,
    Stream,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Metrics, Topic::Controls, Topic::Stream];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Metrics => "metrics",
            Topic::Controls => "controls",
            Topic::Stream => "stream",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metrics" | "telemetry" => Ok(Topic::Metrics),
            "controls" | "systemControls" => Ok(Topic::Controls),
            "stream" => Ok(Topic::Stream),
            other => Err(Error::UnknownTopic(other.to_string())),
        }
    }
}

/// Latest sensor readings reported by the field device.
///
/// Values are kept exactly as reported; out-of-range readings are how sensor
/// faults become visible, so nothing here clamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub temperature: f64,
    pub humidity: f64,
    #[serde(rename = "pH")]
    pub ph: f64,
    pub water_level: f64,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    pub fn display(&self) -> DisplayReadings {
        DisplayReadings {
            temperature: self.temperature,
            temperature_gauge: (self.temperature / TEMPERATURE_GAUGE_MAX).clamp(0.0, 1.0),
            humidity: self.humidity.clamp(0.0, 100.0),
            ph: self.ph,
            ph_gauge: (self.ph / PH_MAX).clamp(0.0, 1.0),
            water_level: self.water_level.clamp(0.0, 100.0),
            captured_at: self.captured_at,
        }
    }
}

/// Readings prepared for gauges. Percentages and gauge fractions are clamped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayReadings {
    pub temperature: f64,
    pub temperature_gauge: f64,
    pub humidity: f64,
    #[serde(rename = "pH")]
    pub ph: f64,
    pub ph_gauge: f64,
    pub water_level: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpCycle {
    pub on_for: i64,
    pub off_for: i64,
}

/// Actuator parameters committed by the operator and pulled by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    pub temp_range: f64,
    pub ph_range: f64,
    pub pump_cycle: PumpCycle,
    pub nutrient_pump_running_time: i64,
}

/// One still image from the camera agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    pub frame: Option<Frame>,
    pub live: bool,
}

impl StreamState {
    /// Builds the state from a camera payload. An empty payload is the
    /// camera's explicit offline signal.
    pub fn from_payload(payload: &[u8], captured_at: DateTime<Utc>) -> Self {
        if payload.is_empty() {
            return Self::offline();
        }
        Self {
            frame: Some(Frame {
                data: Arc::from(payload),
                captured_at,
            }),
            live: true,
        }
    }

    pub fn offline() -> Self {
        Self {
            frame: None,
            live: false,
        }
    }
}

impl Serialize for StreamState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StreamState", 3)?;
        state.serialize_field("live", &self.live)?;
        state.serialize_field(
            "image",
            &self.frame.as_ref().map(|f| BASE64.encode(&f.data)),
        )?;
        state.serialize_field("capturedAt", &self.frame.as_ref().map(|f| f.captured_at))?;
        state.end()
    }
}

/// A value of any topic, used where the topic is only known at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TopicValue {
    Metrics(TelemetrySnapshot),
    Controls(ControlConfig),
    Stream(StreamState),
}

impl TopicValue {
    pub fn topic(&self) -> Topic {
        match self {
            TopicValue::Metrics(_) => Topic::Metrics,
            TopicValue::Controls(_) => Topic::Controls,
            TopicValue::Stream(_) => Topic::Stream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<T> {
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            revision: self.revision,
            updated_at: self.updated_at,
            value: f(self.value),
        }
    }
}

/// Current content of a topic. `Uninitialized` is distinct from any zero value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Slot<T> {
    Uninitialized,
    Ready(Versioned<T>),
}

impl<T> Slot<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Slot::Ready(_))
    }

    pub fn revision(&self) -> u64 {
        match self {
            Slot::Uninitialized => 0,
            Slot::Ready(v) => v.revision,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Slot<U> {
        match self {
            Slot::Uninitialized => Slot::Uninitialized,
            Slot::Ready(v) => Slot::Ready(v.map(f)),
        }
    }

    pub fn ready(self, topic: Topic) -> Result<Versioned<T>> {
        match self {
            Slot::Uninitialized => Err(Error::Uninitialized(topic)),
            Slot::Ready(v) => Ok(v),
        }
    }
}
