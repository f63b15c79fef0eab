use crate::fixed::ramp_from_volts_per_ms;
use crate::protocol::MAX_DEVICE;
use serde::{Deserialize, Serialize};

// All timings are in scheduler ticks (nominally 1 ms).
const SEND_TIMEOUT_TICKS: u32 = 2;
const ACK_TIMEOUT_TICKS: u32 = 5;
const UPDATE_TIMEOUT_TICKS: u32 = 3000;
const SETTLING_TICKS: u32 = 80;
// 25 status sweeps and heartbeats per second.
const SWEEP_PERIOD_TICKS: u32 = 1000 / 25;
const ASSIGN_WINDOW_TICKS: u32 = 5000;
// Controllers running newer firmware than this answer parameter reads.
const READ_CAPABLE_FIRMWARE: u32 = 3330;

/// Engine timing and behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub send_timeout_ticks: u32,
    pub ack_timeout_ticks: u32,
    pub update_timeout_ticks: u32,
    pub settling_ticks: u32,
    pub sweep_period_ticks: u32,
    pub assign_window_ticks: u32,
    pub heartbeat: bool,
    pub status_polling: bool,
    pub read_capable_firmware: u32,
    pub initial_target: u8,
    pub default_voltage_ramp: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout_ticks: SEND_TIMEOUT_TICKS,
            ack_timeout_ticks: ACK_TIMEOUT_TICKS,
            update_timeout_ticks: UPDATE_TIMEOUT_TICKS,
            settling_ticks: SETTLING_TICKS,
            sweep_period_ticks: SWEEP_PERIOD_TICKS,
            assign_window_ticks: ASSIGN_WINDOW_TICKS,
            heartbeat: true,
            status_polling: false,
            read_capable_firmware: READ_CAPABLE_FIRMWARE,
            initial_target: 1,
            default_voltage_ramp: ramp_from_volts_per_ms(30),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_timeout_ticks == 0 || self.ack_timeout_ticks == 0 || self.update_timeout_ticks == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least one tick"));
        }
        if self.sweep_period_ticks == 0 {
            return Err(ConfigError::Invalid("sweep period must be at least one tick"));
        }
        if !(1..=MAX_DEVICE).contains(&self.initial_target) {
            return Err(ConfigError::Invalid("initial target must be in 1..=63"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_firmware_timing() {
        let config = EngineConfig::default();
        assert_eq!(config.send_timeout_ticks, 2);
        assert_eq!(config.ack_timeout_ticks, 5);
        assert_eq!(config.update_timeout_ticks, 3000);
        assert_eq!(config.settling_ticks, 80);
        assert_eq!(config.sweep_period_ticks, 40);
        assert_eq!(config.default_voltage_ramp, 819);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"ack_timeout_ticks": 20, "heartbeat": false}"#).unwrap();
        assert_eq!(config.ack_timeout_ticks, 20);
        assert!(!config.heartbeat);
        assert_eq!(config.settling_ticks, 80);
    }

    #[test]
    fn test_json_round_trip() {
        let config = EngineConfig { initial_target: 9, ..EngineConfig::default() };
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"initial_target": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"ack_timeout_ticks": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
