use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};

/// Maximum number of data bytes carried by a single frame.
pub const MAX_PAYLOAD: usize = 8;

pub type Payload = Vec<u8, MAX_PAYLOAD>;

// Identifier layout: [device-type:5][manufacturer:8][api:10][device-number:6]
pub const DTYPE_MASK: u32 = 0x1F00_0000;
pub const MFR_MASK: u32 = 0x00FF_0000;
pub const API_MASK: u32 = 0x0000_FFC0;
pub const DEVNO_MASK: u32 = 0x0000_003F;
pub const FULL_MASK: u32 = 0x1FFF_FFFF;

const DTYPE_SHIFT: u32 = 24;
const MFR_SHIFT: u32 = 16;
const API_SHIFT: u32 = 6;

pub const DTYPE_MOTOR: u32 = 0x0200_0000;
pub const DTYPE_UPDATE: u32 = 0x1F00_0000;
pub const MFR_LM: u32 = 0x0002_0000;

/// Highest addressable device number.
pub const MAX_DEVICE: u8 = 63;

/// A 29-bit extended CAN identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(u32);

impl MessageId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & FULL_MASK)
    }

    pub const fn new(device_type: u8, manufacturer: u8, api: u16, device: u8) -> Self {
        Self(
            (((device_type as u32) << DTYPE_SHIFT) & DTYPE_MASK)
                | (((manufacturer as u32) << MFR_SHIFT) & MFR_MASK)
                | (((api as u32) << API_SHIFT) & API_MASK)
                | ((device as u32) & DEVNO_MASK),
        )
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn device_type(self) -> u8 {
        ((self.0 & DTYPE_MASK) >> DTYPE_SHIFT) as u8
    }

    pub const fn manufacturer(self) -> u8 {
        ((self.0 & MFR_MASK) >> MFR_SHIFT) as u8
    }

    pub const fn api(self) -> u16 {
        ((self.0 & API_MASK) >> API_SHIFT) as u16
    }

    pub const fn device(self) -> u8 {
        (self.0 & DEVNO_MASK) as u8
    }

    /// The identifier with its device number cleared.
    pub const fn class(self) -> Self {
        Self(self.0 & !DEVNO_MASK)
    }

    pub const fn with_device(self, device: u8) -> Self {
        Self((self.0 & !DEVNO_MASK) | ((device as u32) & DEVNO_MASK))
    }

    /// True for frames that carry neither a device type nor a manufacturer
    /// tag, i.e. system-wide broadcast commands.
    pub const fn is_system(self) -> bool {
        self.0 & (DTYPE_MASK | MFR_MASK) == 0
    }

    pub const fn is_update_class(self) -> bool {
        self.0 & (DTYPE_MASK | MFR_MASK) == DTYPE_UPDATE | MFR_LM
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// API class identifiers. All of them carry device number 0; combine with
/// [`MessageId::with_device`] to address a controller.
pub mod api {
    use super::{MessageId, DTYPE_MOTOR, DTYPE_UPDATE, MFR_LM};

    const fn sys(api: u32) -> MessageId {
        MessageId::from_raw(api << 6)
    }

    const fn motor(class: u32, index: u32) -> MessageId {
        MessageId::from_raw(DTYPE_MOTOR | MFR_LM | (class << 10) | (index << 6))
    }

    const fn update(index: u32) -> MessageId {
        MessageId::from_raw(DTYPE_UPDATE | MFR_LM | (index << 6))
    }

    // System broadcast class.
    pub const SYS_HALT: MessageId = sys(0);
    pub const SYS_RESET: MessageId = sys(1);
    pub const DEV_ASSIGN: MessageId = sys(2);
    pub const HEARTBEAT: MessageId = sys(5);
    pub const SYNC: MessageId = sys(6);
    pub const UPDATE: MessageId = sys(7);
    pub const FIRMWARE_VERSION: MessageId = sys(8);
    pub const ENUMERATE: MessageId = sys(9);
    pub const SYS_RESUME: MessageId = sys(10);

    // Voltage control.
    pub const VOLT_EN: MessageId = motor(0, 0);
    pub const VOLT_DIS: MessageId = motor(0, 1);
    pub const VOLT_SET: MessageId = motor(0, 2);
    pub const VOLT_SET_RAMP: MessageId = motor(0, 3);

    // Speed control.
    pub const SPD_EN: MessageId = motor(1, 0);
    pub const SPD_DIS: MessageId = motor(1, 1);
    pub const SPD_SET: MessageId = motor(1, 2);
    pub const SPD_PC: MessageId = motor(1, 3);
    pub const SPD_IC: MessageId = motor(1, 4);
    pub const SPD_DC: MessageId = motor(1, 5);
    pub const SPD_REF: MessageId = motor(1, 6);

    // Voltage compensation control.
    pub const VCOMP_EN: MessageId = motor(2, 0);
    pub const VCOMP_DIS: MessageId = motor(2, 1);
    pub const VCOMP_SET: MessageId = motor(2, 2);
    pub const VCOMP_IN_RAMP: MessageId = motor(2, 3);
    pub const VCOMP_COMP_RAMP: MessageId = motor(2, 4);

    // Position control.
    pub const POS_EN: MessageId = motor(3, 0);
    pub const POS_DIS: MessageId = motor(3, 1);
    pub const POS_SET: MessageId = motor(3, 2);
    pub const POS_PC: MessageId = motor(3, 3);
    pub const POS_IC: MessageId = motor(3, 4);
    pub const POS_DC: MessageId = motor(3, 5);
    pub const POS_REF: MessageId = motor(3, 6);

    // Current control.
    pub const ICTRL_EN: MessageId = motor(4, 0);
    pub const ICTRL_DIS: MessageId = motor(4, 1);
    pub const ICTRL_SET: MessageId = motor(4, 2);
    pub const ICTRL_PC: MessageId = motor(4, 3);
    pub const ICTRL_IC: MessageId = motor(4, 4);
    pub const ICTRL_DC: MessageId = motor(4, 5);

    // Status.
    pub const STATUS_VOUT: MessageId = motor(5, 0);
    pub const STATUS_VBUS: MessageId = motor(5, 1);
    pub const STATUS_FAULT: MessageId = motor(5, 2);
    pub const STATUS_CURRENT: MessageId = motor(5, 3);
    pub const STATUS_TEMP: MessageId = motor(5, 4);
    pub const STATUS_POS: MessageId = motor(5, 5);
    pub const STATUS_SPD: MessageId = motor(5, 6);
    pub const STATUS_LIMIT: MessageId = motor(5, 7);
    pub const STATUS_POWER: MessageId = motor(5, 8);

    // Configuration.
    pub const CFG_NUM_BRUSHES: MessageId = motor(7, 0);
    pub const CFG_ENC_LINES: MessageId = motor(7, 1);
    pub const CFG_POT_TURNS: MessageId = motor(7, 2);
    pub const CFG_BRAKE_COAST: MessageId = motor(7, 3);
    pub const CFG_LIMIT_MODE: MessageId = motor(7, 4);
    pub const CFG_LIMIT_FWD: MessageId = motor(7, 5);
    pub const CFG_LIMIT_REV: MessageId = motor(7, 6);
    pub const CFG_MAX_VOUT: MessageId = motor(7, 7);

    // Generic acknowledgement.
    pub const ACK: MessageId = motor(8, 0);

    // Boot loader.
    pub const UPD_PING: MessageId = update(0);
    pub const UPD_DOWNLOAD: MessageId = update(1);
    pub const UPD_SEND_DATA: MessageId = update(2);
    pub const UPD_RESET: MessageId = update(3);
    pub const UPD_ACK: MessageId = update(4);

    /// Setpoint, gain and configuration classes that echo their value when
    /// read with a zero-length request.
    pub const PARAMETERS: [MessageId; 27] = [
        VOLT_SET,
        VOLT_SET_RAMP,
        VCOMP_SET,
        VCOMP_IN_RAMP,
        VCOMP_COMP_RAMP,
        SPD_SET,
        SPD_PC,
        SPD_IC,
        SPD_DC,
        SPD_REF,
        POS_SET,
        POS_PC,
        POS_IC,
        POS_DC,
        POS_REF,
        ICTRL_SET,
        ICTRL_PC,
        ICTRL_IC,
        ICTRL_DC,
        CFG_NUM_BRUSHES,
        CFG_ENC_LINES,
        CFG_POT_TURNS,
        CFG_BRAKE_COAST,
        CFG_LIMIT_MODE,
        CFG_LIMIT_FWD,
        CFG_LIMIT_REV,
        CFG_MAX_VOUT,
    ];

    pub fn is_parameter(class: MessageId) -> bool {
        PARAMETERS.contains(&class)
    }

    /// Look up a class by its conventional short name, e.g. `"spd_pc"`.
    pub fn by_name(name: &str) -> Option<MessageId> {
        let class = match name.to_ascii_lowercase().as_str() {
            "volt_set" => VOLT_SET,
            "volt_set_ramp" => VOLT_SET_RAMP,
            "vcomp_set" => VCOMP_SET,
            "vcomp_in_ramp" => VCOMP_IN_RAMP,
            "vcomp_comp_ramp" => VCOMP_COMP_RAMP,
            "spd_set" => SPD_SET,
            "spd_pc" => SPD_PC,
            "spd_ic" => SPD_IC,
            "spd_dc" => SPD_DC,
            "spd_ref" => SPD_REF,
            "pos_set" => POS_SET,
            "pos_pc" => POS_PC,
            "pos_ic" => POS_IC,
            "pos_dc" => POS_DC,
            "pos_ref" => POS_REF,
            "ictrl_set" => ICTRL_SET,
            "ictrl_pc" => ICTRL_PC,
            "ictrl_ic" => ICTRL_IC,
            "ictrl_dc" => ICTRL_DC,
            "cfg_num_brushes" => CFG_NUM_BRUSHES,
            "cfg_enc_lines" => CFG_ENC_LINES,
            "cfg_pot_turns" => CFG_POT_TURNS,
            "cfg_brake_coast" => CFG_BRAKE_COAST,
            "cfg_limit_mode" => CFG_LIMIT_MODE,
            "cfg_limit_fwd" => CFG_LIMIT_FWD,
            "cfg_limit_rev" => CFG_LIMIT_REV,
            "cfg_max_vout" => CFG_MAX_VOUT,
            "status_vout" => STATUS_VOUT,
            "status_vbus" => STATUS_VBUS,
            "status_fault" => STATUS_FAULT,
            "status_current" => STATUS_CURRENT,
            "status_temp" => STATUS_TEMP,
            "status_pos" => STATUS_POS,
            "status_spd" => STATUS_SPD,
            "status_limit" => STATUS_LIMIT,
            "status_power" => STATUS_POWER,
            _ => return None,
        };
        Some(class)
    }
}

/// Whether a frame carries data or requests it from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Data,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: MessageId,
    pub kind: FrameKind,
    pub data: Payload,
}

impl Frame {
    pub fn data(id: MessageId, data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            kind: FrameKind::Data,
            data: payload(data)?,
        })
    }

    pub fn remote(id: MessageId) -> Self {
        Self {
            id,
            kind: FrameKind::Remote,
            data: Payload::new(),
        }
    }
}

/// Copy `bytes` into a payload, rejecting anything longer than a frame.
pub fn payload(bytes: &[u8]) -> Result<Payload, ProtocolError> {
    Payload::from_slice(bytes).map_err(|()| ProtocolError::PayloadTooLong(bytes.len()))
}

/// Little-endian field readers that reject short payloads.
pub(crate) fn read_u8(data: &[u8]) -> Result<u8, ProtocolError> {
    data.first()
        .copied()
        .ok_or(ProtocolError::Malformed { expected: 1, actual: data.len() })
}

pub(crate) fn read_u16(data: &[u8]) -> Result<u16, ProtocolError> {
    match data {
        [a, b, ..] => Ok(u16::from_le_bytes([*a, *b])),
        _ => Err(ProtocolError::Malformed { expected: 2, actual: data.len() }),
    }
}

pub(crate) fn read_u32(data: &[u8]) -> Result<u32, ProtocolError> {
    match data {
        [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(ProtocolError::Malformed { expected: 4, actual: data.len() }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the 8 byte frame limit")]
    PayloadTooLong(usize),
    #[error("malformed response: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
}
