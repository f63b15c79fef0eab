use crate::fixed::{fraction_to_percent, Q16_16, Q8_8};
use crate::protocol::{api, MessageId, MAX_DEVICE};
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

/// Firmware version reported before a controller has answered.
pub const FIRMWARE_UNKNOWN: u32 = 0xFFFF_FFFF;

/// A measured quantity and whether it reflects the current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusField<T> {
    value: T,
    valid: bool,
}

impl<T: Copy> StatusField<T> {
    pub const fn new(value: T) -> Self {
        Self { value, valid: false }
    }

    pub fn get(&self) -> (T, bool) {
        (self.value, self.valid)
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

/// The status quantities polled from the target controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Vout,
    Vbus,
    Current,
    Temperature,
    Position,
    Speed,
    Limit,
    Fault,
    FirmwareVersion,
}

impl StatusKind {
    /// Order of the status sweep. Each response queues the next entry.
    pub const CHAIN: [StatusKind; 8] = [
        StatusKind::Vout,
        StatusKind::Vbus,
        StatusKind::Current,
        StatusKind::Temperature,
        StatusKind::Position,
        StatusKind::Speed,
        StatusKind::Limit,
        StatusKind::Fault,
    ];

    pub fn class(self) -> MessageId {
        match self {
            StatusKind::Vout => api::STATUS_VOUT,
            StatusKind::Vbus => api::STATUS_VBUS,
            StatusKind::Current => api::STATUS_CURRENT,
            StatusKind::Temperature => api::STATUS_TEMP,
            StatusKind::Position => api::STATUS_POS,
            StatusKind::Speed => api::STATUS_SPD,
            StatusKind::Limit => api::STATUS_LIMIT,
            StatusKind::Fault => api::STATUS_FAULT,
            StatusKind::FirmwareVersion => api::FIRMWARE_VERSION,
        }
    }

    pub fn from_class(class: MessageId) -> Option<Self> {
        Self::CHAIN
            .iter()
            .copied()
            .chain(core::iter::once(StatusKind::FirmwareVersion))
            .find(|kind| kind.class() == class)
    }

    /// The poll that follows this one in the sweep, if any.
    pub fn next(self) -> Option<Self> {
        let index = Self::CHAIN.iter().position(|kind| *kind == self)?;
        Self::CHAIN.get(index + 1).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBlock {
    pub vout: StatusField<i16>,
    pub vbus: StatusField<u16>,
    pub current: StatusField<i16>,
    pub temperature: StatusField<u16>,
    pub position: StatusField<i32>,
    pub speed: StatusField<i32>,
    pub limit: StatusField<u8>,
    pub fault: StatusField<u16>,
    pub firmware_version: StatusField<u32>,
}

impl StatusBlock {
    pub const fn new() -> Self {
        Self {
            vout: StatusField::new(0),
            vbus: StatusField::new(0),
            current: StatusField::new(0),
            temperature: StatusField::new(0),
            position: StatusField::new(0),
            speed: StatusField::new(0),
            limit: StatusField::new(0),
            fault: StatusField::new(0),
            firmware_version: StatusField::new(FIRMWARE_UNKNOWN),
        }
    }

    pub fn invalidate(&mut self, kind: StatusKind) {
        match kind {
            StatusKind::Vout => self.vout.invalidate(),
            StatusKind::Vbus => self.vbus.invalidate(),
            StatusKind::Current => self.current.invalidate(),
            StatusKind::Temperature => self.temperature.invalidate(),
            StatusKind::Position => self.position.invalidate(),
            StatusKind::Speed => self.speed.invalidate(),
            StatusKind::Limit => self.limit.invalidate(),
            StatusKind::Fault => self.fault.invalidate(),
            StatusKind::FirmwareVersion => self.firmware_version.invalidate(),
        }
    }

    pub fn invalidate_all(&mut self) {
        for kind in StatusKind::CHAIN {
            self.invalidate(kind);
        }
        self.firmware_version = StatusField::new(FIRMWARE_UNKNOWN);
    }

    pub fn is_valid(&self, kind: StatusKind) -> bool {
        match kind {
            StatusKind::Vout => self.vout.is_valid(),
            StatusKind::Vbus => self.vbus.is_valid(),
            StatusKind::Current => self.current.is_valid(),
            StatusKind::Temperature => self.temperature.is_valid(),
            StatusKind::Position => self.position.is_valid(),
            StatusKind::Speed => self.speed.is_valid(),
            StatusKind::Limit => self.limit.is_valid(),
            StatusKind::Fault => self.fault.is_valid(),
            StatusKind::FirmwareVersion => self.firmware_version.is_valid(),
        }
    }

    pub fn any_valid(&self) -> bool {
        StatusKind::CHAIN
            .iter()
            .chain(core::iter::once(&StatusKind::FirmwareVersion))
            .any(|kind| self.is_valid(*kind))
    }

    /// Engineering-unit view for reporting.
    pub fn snapshot(&self, target: u8) -> StatusSnapshot {
        let scaled = |valid: bool, value: f64| valid.then_some(value);
        StatusSnapshot {
            target,
            vout_percent: scaled(self.vout.is_valid(), f64::from(fraction_to_percent(self.vout.value()))),
            vbus_volts: scaled(self.vbus.is_valid(), f64::from(Q8_8::from_unsigned(self.vbus.value()))),
            current_amps: scaled(self.current.is_valid(), f64::from(Q8_8(self.current.value()).to_f32())),
            temperature_c: scaled(
                self.temperature.is_valid(),
                f64::from(Q8_8::from_unsigned(self.temperature.value())),
            ),
            position_revs: scaled(self.position.is_valid(), Q16_16(self.position.value()).to_f64()),
            speed_rpm: scaled(self.speed.is_valid(), Q16_16(self.speed.value()).to_f64()),
            limit: self.limit.is_valid().then(|| self.limit.value()),
            fault: self.fault.is_valid().then(|| self.fault.value()),
            firmware_version: self.firmware_version.is_valid().then(|| self.firmware_version.value()),
        }
    }
}

impl Default for StatusBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable status report; `None` marks a field that is not valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub target: u8,
    pub vout_percent: Option<f64>,
    pub vbus_volts: Option<f64>,
    pub current_amps: Option<f64>,
    pub temperature_c: Option<f64>,
    pub position_revs: Option<f64>,
    pub speed_rpm: Option<f64>,
    pub limit: Option<u8>,
    pub fault: Option<u16>,
    pub firmware_version: Option<u32>,
}

/// Devices that answered the most recent enumeration, indexed 1..=63.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceBitmap(u64);

impl PresenceBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, device: u8) {
        if (1..=MAX_DEVICE).contains(&device) {
            self.0 |= 1u64 << device;
        }
    }

    pub fn contains(&self, device: u8) -> bool {
        device <= MAX_DEVICE && self.0 & (1u64 << device) != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn devices(&self) -> ArrayVec<u8, 63> {
        (1..=MAX_DEVICE).filter(|device| self.contains(*device)).collect()
    }
}
