use crate::protocol::{api, payload, MessageId, Payload, ProtocolError};
use serde::{Deserialize, Serialize};

/// Every command the host issues to a motor controller or boot loader.
///
/// Commands addressed to "the current device" are encoded against the
/// engine's target address at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    SystemHalt,
    SystemResume,
    SystemReset,
    Assign { device: u8 },
    Enumerate,
    SyncUpdate { group: u8 },
    FirmwareVersion,

    VoltageModeEnable,
    VoltageModeDisable,
    VoltageSet { value: i16, group: u8 },
    VoltageRampSet { ramp: u16 },

    VCompModeEnable,
    VCompModeDisable,
    VCompSet { value: i16, group: u8 },
    VCompInRampSet { ramp: u16 },
    VCompCompRampSet { ramp: u16 },

    SpeedModeEnable,
    SpeedModeDisable,
    SpeedSet { value: i32, group: u8 },
    SpeedPGainSet { gain: i32 },
    SpeedIGainSet { gain: i32 },
    SpeedDGainSet { gain: i32 },
    SpeedRefSet { reference: u8 },

    PositionModeEnable { position: i32 },
    PositionModeDisable,
    PositionSet { value: i32, group: u8 },
    PositionPGainSet { gain: i32 },
    PositionIGainSet { gain: i32 },
    PositionDGainSet { gain: i32 },
    PositionRefSet { reference: u8 },

    CurrentModeEnable,
    CurrentModeDisable,
    CurrentSet { value: i16, group: u8 },
    CurrentPGainSet { gain: i32 },
    CurrentIGainSet { gain: i32 },
    CurrentDGainSet { gain: i32 },

    ConfigNumBrushes { brushes: u8 },
    ConfigEncoderLines { lines: u16 },
    ConfigPotTurns { turns: u16 },
    ConfigBrakeCoast { mode: u8 },
    ConfigLimitMode { mode: u8 },
    ConfigLimitForward { position: i32, compare: u8 },
    ConfigLimitReverse { position: i32, compare: u8 },
    ConfigMaxVout { voltage: u16 },

    StatusPowerClear,

    UpdateStart,
    UpdatePing,
    UpdateDownload { address: u32, size: u32 },
    UpdateSendData { data: Payload },
    UpdateReset,
}

impl Command {
    /// Encode against `target`, the currently selected device number.
    pub fn encode(&self, target: u8) -> Result<(MessageId, Payload), ProtocolError> {
        let to = |class: MessageId| class.with_device(target);
        let (id, bytes): (MessageId, Payload) = match self {
            Command::SystemHalt => (api::SYS_HALT, Payload::new()),
            Command::SystemResume => (api::SYS_RESUME, Payload::new()),
            Command::SystemReset => (api::SYS_RESET, Payload::new()),
            Command::Assign { device } => (api::DEV_ASSIGN, payload(&[device & 0x3F])?),
            Command::Enumerate => (api::ENUMERATE, Payload::new()),
            Command::SyncUpdate { group } => (api::SYNC, payload(&[*group])?),
            Command::FirmwareVersion => (to(api::FIRMWARE_VERSION), Payload::new()),

            Command::VoltageModeEnable => (to(api::VOLT_EN), Payload::new()),
            Command::VoltageModeDisable => (to(api::VOLT_DIS), Payload::new()),
            Command::VoltageSet { value, group } => (to(api::VOLT_SET), with_group16(*value, *group)?),
            Command::VoltageRampSet { ramp } => (to(api::VOLT_SET_RAMP), payload(&ramp.to_le_bytes())?),

            Command::VCompModeEnable => (to(api::VCOMP_EN), Payload::new()),
            Command::VCompModeDisable => (to(api::VCOMP_DIS), Payload::new()),
            Command::VCompSet { value, group } => (to(api::VCOMP_SET), with_group16(*value, *group)?),
            Command::VCompInRampSet { ramp } => (to(api::VCOMP_IN_RAMP), payload(&ramp.to_le_bytes())?),
            Command::VCompCompRampSet { ramp } => {
                (to(api::VCOMP_COMP_RAMP), payload(&ramp.to_le_bytes())?)
            }

            Command::SpeedModeEnable => (to(api::SPD_EN), Payload::new()),
            Command::SpeedModeDisable => (to(api::SPD_DIS), Payload::new()),
            Command::SpeedSet { value, group } => (to(api::SPD_SET), with_group32(*value, *group)?),
            Command::SpeedPGainSet { gain } => (to(api::SPD_PC), payload(&gain.to_le_bytes())?),
            Command::SpeedIGainSet { gain } => (to(api::SPD_IC), payload(&gain.to_le_bytes())?),
            Command::SpeedDGainSet { gain } => (to(api::SPD_DC), payload(&gain.to_le_bytes())?),
            Command::SpeedRefSet { reference } => (to(api::SPD_REF), payload(&[*reference])?),

            Command::PositionModeEnable { position } => {
                (to(api::POS_EN), payload(&position.to_le_bytes())?)
            }
            Command::PositionModeDisable => (to(api::POS_DIS), Payload::new()),
            Command::PositionSet { value, group } => (to(api::POS_SET), with_group32(*value, *group)?),
            Command::PositionPGainSet { gain } => (to(api::POS_PC), payload(&gain.to_le_bytes())?),
            Command::PositionIGainSet { gain } => (to(api::POS_IC), payload(&gain.to_le_bytes())?),
            Command::PositionDGainSet { gain } => (to(api::POS_DC), payload(&gain.to_le_bytes())?),
            Command::PositionRefSet { reference } => (to(api::POS_REF), payload(&[*reference])?),

            Command::CurrentModeEnable => (to(api::ICTRL_EN), Payload::new()),
            Command::CurrentModeDisable => (to(api::ICTRL_DIS), Payload::new()),
            Command::CurrentSet { value, group } => (to(api::ICTRL_SET), with_group16(*value, *group)?),
            Command::CurrentPGainSet { gain } => (to(api::ICTRL_PC), payload(&gain.to_le_bytes())?),
            Command::CurrentIGainSet { gain } => (to(api::ICTRL_IC), payload(&gain.to_le_bytes())?),
            Command::CurrentDGainSet { gain } => (to(api::ICTRL_DC), payload(&gain.to_le_bytes())?),

            Command::ConfigNumBrushes { brushes } => (to(api::CFG_NUM_BRUSHES), payload(&[*brushes])?),
            Command::ConfigEncoderLines { lines } => (to(api::CFG_ENC_LINES), payload(&lines.to_le_bytes())?),
            Command::ConfigPotTurns { turns } => (to(api::CFG_POT_TURNS), payload(&turns.to_le_bytes())?),
            Command::ConfigBrakeCoast { mode } => (to(api::CFG_BRAKE_COAST), payload(&[*mode])?),
            Command::ConfigLimitMode { mode } => (to(api::CFG_LIMIT_MODE), payload(&[*mode])?),
            Command::ConfigLimitForward { position, compare } => {
                (to(api::CFG_LIMIT_FWD), with_group32(*position, *compare)?)
            }
            Command::ConfigLimitReverse { position, compare } => {
                (to(api::CFG_LIMIT_REV), with_group32(*position, *compare)?)
            }
            Command::ConfigMaxVout { voltage } => (to(api::CFG_MAX_VOUT), payload(&voltage.to_le_bytes())?),

            Command::StatusPowerClear => (to(api::STATUS_POWER), payload(&[1])?),

            Command::UpdateStart => (api::UPDATE, payload(&[target])?),
            Command::UpdatePing => (api::UPD_PING, Payload::new()),
            Command::UpdateDownload { address, size } => {
                let mut bytes = [0u8; 8];
                bytes[..4].copy_from_slice(&address.to_le_bytes());
                bytes[4..].copy_from_slice(&size.to_le_bytes());
                (api::UPD_DOWNLOAD, payload(&bytes)?)
            }
            Command::UpdateSendData { data } => (api::UPD_SEND_DATA, data.clone()),
            Command::UpdateReset => (api::UPD_RESET, Payload::new()),
        };
        Ok((id, bytes))
    }
}

fn with_group16(value: i16, group: u8) -> Result<Payload, ProtocolError> {
    let [lo, hi] = value.to_le_bytes();
    payload(&[lo, hi, group])
}

fn with_group32(value: i32, group: u8) -> Result<Payload, ProtocolError> {
    let [a, b, c, d] = value.to_le_bytes();
    payload(&[a, b, c, d, group])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_set_layout() {
        let (id, data) = Command::VoltageSet { value: -2, group: 3 }.encode(9).unwrap();
        assert_eq!(id, api::VOLT_SET.with_device(9));
        assert_eq!(&data[..], &[0xFE, 0xFF, 3]);
    }

    #[test]
    fn test_speed_set_layout() {
        let (id, data) = Command::SpeedSet { value: 0x0001_8000, group: 0 }.encode(2).unwrap();
        assert_eq!(id.device(), 2);
        assert_eq!(&data[..], &[0x00, 0x80, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_broadcast_commands_ignore_target() {
        let (id, data) = Command::Assign { device: 0x45 }.encode(7).unwrap();
        assert_eq!(id, api::DEV_ASSIGN);
        assert_eq!(&data[..], &[0x05]);

        let (id, _) = Command::Enumerate.encode(7).unwrap();
        assert!(id.is_system());
        assert_eq!(id.device(), 0);
    }

    #[test]
    fn test_update_start_carries_target() {
        let (id, data) = Command::UpdateStart.encode(12).unwrap();
        assert_eq!(id, api::UPDATE);
        assert_eq!(&data[..], &[12]);
    }

    #[test]
    fn test_download_layout() {
        let (id, data) = Command::UpdateDownload { address: 0x800, size: 0x1234 }.encode(1).unwrap();
        assert_eq!(id, api::UPD_DOWNLOAD);
        assert_eq!(&data[..], &[0x00, 0x08, 0, 0, 0x34, 0x12, 0, 0]);
    }

    #[test]
    fn test_command_json() {
        let json = r#"{"VoltageSet":{"value":1000,"group":0}}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        assert_eq!(command, Command::VoltageSet { value: 1000, group: 0 });
    }
}
