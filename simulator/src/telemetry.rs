use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub temperature: f64,
    pub humidity: f64,
    #[serde(rename = "pH")]
    pub ph: f64,
    pub water_level: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpCycle {
    pub on_for: i64,
    pub off_for: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    pub temp_range: f64,
    pub ph_range: f64,
    pub pump_cycle: PumpCycle,
    pub nutrient_pump_running_time: i64,
}

/// Crude grow-chamber model. Readings drift toward the committed targets and
/// occasionally spike to mimic a faulty sensor.
pub struct SensorModel {
    temperature: f64,
    humidity: f64,
    ph: f64,
    water_level: f64,
}

impl Default for SensorModel {
    fn default() -> Self {
        Self {
            temperature: 22.0,
            humidity: 70.0,
            ph: 6.0,
            water_level: 90.0,
        }
    }
}

impl SensorModel {
    pub fn step(&mut self, rng: &mut impl Rng, controls: Option<&ControlConfig>) -> TelemetrySnapshot {
        if let Some(c) = controls {
            self.temperature += (c.temp_range - self.temperature) * 0.1;
            self.ph += (c.ph_range - self.ph) * 0.1;
        }
        self.temperature += rng.gen_range(-0.3..0.3);
        self.ph += rng.gen_range(-0.05..0.05);
        self.humidity = (self.humidity + rng.gen_range(-1.5..1.5)).clamp(30.0, 99.0);

        // Reservoir drains slowly and is topped up when low
        self.water_level -= rng.gen_range(0.0..0.2);
        if self.water_level < 20.0 {
            self.water_level = 95.0;
        }

        let temperature = if rng.gen_bool(0.02) {
            rng.gen_range(-50.0..100.0) // 2% sensor faults
        } else {
            self.temperature
        };

        TelemetrySnapshot {
            temperature,
            humidity: self.humidity,
            ph: self.ph,
            water_level: self.water_level,
            captured_at: Utc::now(),
        }
    }
}

/// Fake JPEG frame: SOI marker, random body, EOI marker.
pub fn fake_frame(rng: &mut impl Rng, size: usize) -> Vec<u8> {
    let size = size.max(4);
    let mut frame = vec![0u8; size];
    rng.fill(&mut frame[..]);
    frame[0] = 0xff;
    frame[1] = 0xd8;
    frame[size - 2] = 0xff;
    frame[size - 1] = 0xd9;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_drifts_toward_targets() {
        let mut rng = rand::thread_rng();
        let mut model = SensorModel::default();
        let controls = ControlConfig {
            temp_range: 28.0,
            ph_range: 5.5,
            pump_cycle: PumpCycle {
                on_for: 30,
                off_for: 300,
            },
            nutrient_pump_running_time: 600,
        };

        for _ in 0..200 {
            model.step(&mut rng, Some(&controls));
        }
        assert!((model.temperature - 28.0).abs() < 2.0);
        assert!((model.ph - 5.5).abs() < 0.5);
    }

    #[test]
    fn test_fake_frame_markers() {
        let frame = fake_frame(&mut rand::thread_rng(), 64);
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[..2], &[0xff, 0xd8]);
        assert_eq!(&frame[62..], &[0xff, 0xd9]);
    }

    #[test]
    fn test_snapshot_wire_names() {
        let snapshot = SensorModel::default().step(&mut rand::thread_rng(), None);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("pH").is_some());
        assert!(json.get("waterLevel").is_some());
        assert!(json.get("capturedAt").is_some());
    }
}
