use crate::errors::{Error, Result};
use crate::model::{ControlConfig, PH_MAX};

const PH_MIN: f64 = 0.0;

/// Validates an operator-submitted control configuration.
pub fn validate(config: &ControlConfig) -> Result<()> {
    if !config.temp_range.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "tempRange {} is not a finite number",
            config.temp_range
        )));
    }

    if !config.ph_range.is_finite() || config.ph_range < PH_MIN || config.ph_range > PH_MAX {
        return Err(Error::InvalidConfig(format!(
            "phRange {} out of range [{}, {}]",
            config.ph_range, PH_MIN, PH_MAX
        )));
    }

    // Durations are seconds and cannot run backwards
    let durations = [
        ("pumpCycle.onFor", config.pump_cycle.on_for),
        ("pumpCycle.offFor", config.pump_cycle.off_for),
        ("nutrientPumpRunningTime", config.nutrient_pump_running_time),
    ];
    for (field, seconds) in durations {
        if seconds < 0 {
            return Err(Error::InvalidConfig(format!(
                "{} must be non-negative, got {}",
                field, seconds
            )));
        }
    }

    Ok(())
}

/// Parses a JSON control submission, reporting missing or non-numeric fields
/// as `InvalidConfig`.
pub fn parse_config(body: &[u8]) -> Result<ControlConfig> {
    serde_json::from_slice::<ControlConfig>(body)
        .map_err(|e| Error::InvalidConfig(format!("malformed configuration: {}", e)))
}
