use crate::fixed::{FRACTION_FULL_SCALE, Q16_16, Q8_8};
use crate::protocol::{api, read_u16, read_u32, Frame, FrameKind, MessageId, Payload, MAX_DEVICE};
use serde::{Deserialize, Serialize};

const NOMINAL_VBUS: u16 = 12 << 8;
const AMBIENT_TEMPERATURE: u16 = 25 << 8;
const DEFAULT_FIRMWARE: u32 = 4000;
// Free-running speed at full output voltage.
const MAX_SPEED_RPM: f64 = 3000.0;
// Power status flag set by a power-on reset.
const FLAG_POWER_ON_RESET: u8 = 0x01;

/// Which firmware is answering on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMode {
    Application,
    BootLoader,
}

/// Measured quantities a simulated controller reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub vout: i16,
    pub vbus: u16,
    pub current: i16,
    pub temperature: u16,
    pub position: i32,
    pub speed: i32,
    pub limit: u8,
    pub fault: u16,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            vout: 0,
            vbus: NOMINAL_VBUS,
            current: 0,
            temperature: AMBIENT_TEMPERATURE,
            position: 0,
            speed: 0,
            limit: 0x03,
            fault: 0,
        }
    }
}

/// State of a firmware download in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub address: u32,
    pub size: u32,
    pub image: Vec<u8>,
}

/// A simulated motor controller with its boot loader.
#[derive(Debug, Clone)]
pub struct SimPeer {
    device: u8,
    mode: PeerMode,
    firmware_version: u32,
    power_flags: u8,
    status: PeerStatus,
    parameters: Vec<(MessageId, Payload)>,
    button_pressed: bool,
    halted: bool,
    heartbeats: u32,
    download: Option<Download>,
    last_image: Option<Vec<u8>>,
}

impl SimPeer {
    pub fn new(device: u8) -> Self {
        Self {
            device,
            mode: PeerMode::Application,
            firmware_version: DEFAULT_FIRMWARE,
            power_flags: 0,
            status: PeerStatus::default(),
            parameters: Vec::new(),
            button_pressed: false,
            halted: false,
            heartbeats: 0,
            download: None,
            last_image: None,
        }
    }

    pub fn with_firmware(mut self, version: u32) -> Self {
        self.firmware_version = version;
        self
    }

    /// Start as if just powered on, with the power-on-reset flag raised.
    pub fn powered_on(mut self) -> Self {
        self.power_flags |= FLAG_POWER_ON_RESET;
        self
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    pub fn firmware_version(&self) -> u32 {
        self.firmware_version
    }

    pub fn power_on_reset(&self) -> bool {
        self.power_flags & FLAG_POWER_ON_RESET != 0
    }

    pub fn status(&self) -> &PeerStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut PeerStatus {
        &mut self.status
    }

    pub fn heartbeats(&self) -> u32 {
        self.heartbeats
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Most recent value written to `class`.
    pub fn parameter(&self, class: MessageId) -> Option<&Payload> {
        self.parameters
            .iter()
            .find(|(stored, _)| *stored == class)
            .map(|(_, value)| value)
    }

    /// Hold the identify button so the next assignment claims this peer.
    pub fn press_button(&mut self) {
        self.button_pressed = true;
    }

    /// The image programmed by the last completed download.
    pub fn last_image(&self) -> Option<&[u8]> {
        self.last_image.as_deref()
    }

    /// Advance the motor model by `dt_ms`.
    pub fn update(&mut self, dt_ms: u16) {
        if self.mode != PeerMode::Application {
            return;
        }
        let dt = f64::from(dt_ms) / 1000.0;
        let drive = if self.halted {
            0.0
        } else {
            f64::from(self.status.vout) / f64::from(FRACTION_FULL_SCALE)
        };

        let speed = Q16_16(self.status.speed).to_f64();
        let target = drive * MAX_SPEED_RPM;
        let speed = speed + (target - speed) * (dt * 5.0).min(1.0);
        self.status.speed = Q16_16::from_f64(speed).0;

        let position = Q16_16(self.status.position).to_f64() + speed / 60.0 * dt;
        self.status.position = Q16_16::from_f64(position).0;

        let amps = (target - speed).abs() / MAX_SPEED_RPM * 10.0 + drive.abs();
        self.status.current = Q8_8::from_f32(amps as f32).0;

        let temperature = f64::from(Q8_8::from_unsigned(self.status.temperature));
        let ambient = f64::from(Q8_8::from_unsigned(AMBIENT_TEMPERATURE));
        let temperature = temperature + (amps * 0.5 - (temperature - ambient) * 0.1) * dt;
        self.status.temperature = (temperature.max(0.0) * 256.0) as u16;
    }

    /// React to a frame seen on the bus, appending any replies to `replies`.
    pub fn receive(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        match self.mode {
            PeerMode::Application => self.application(frame, replies),
            PeerMode::BootLoader => self.boot_loader(frame, replies),
        }
    }

    fn application(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        let id = frame.id;
        let class = id.class();

        if id.is_system() {
            self.system(frame, replies);
            return;
        }
        if id.device() != self.device || id.is_update_class() {
            return;
        }

        let data = &frame.data[..];
        let known = if class == api::STATUS_POWER {
            if data.is_empty() {
                reply(replies, id, &[self.power_flags]);
            } else if data[0] & FLAG_POWER_ON_RESET != 0 {
                self.power_flags &= !FLAG_POWER_ON_RESET;
            }
            true
        } else if let Some(value) = self.read_status(class) {
            if data.is_empty() {
                reply(replies, id, &value);
            }
            true
        } else if api::is_parameter(class) {
            if data.is_empty() {
                match self.parameter(class) {
                    Some(value) => reply(replies, id, value),
                    None => reply(replies, id, &[0; 4]),
                }
            } else {
                self.write(class, frame.data.clone());
            }
            true
        } else {
            self.mode_change(class)
        };

        if known {
            reply(replies, api::ACK.with_device(self.device), &[]);
        }
    }

    fn system(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        let class = frame.id.class();
        if class == api::ENUMERATE {
            reply(replies, api::ENUMERATE.with_device(self.device), &[]);
        } else if class == api::FIRMWARE_VERSION {
            if frame.kind == FrameKind::Remote && frame.id.device() == self.device {
                reply(replies, frame.id, &self.firmware_version.to_le_bytes());
            }
        } else if class == api::HEARTBEAT {
            self.heartbeats = self.heartbeats.wrapping_add(1);
        } else if class == api::SYS_HALT {
            self.halted = true;
        } else if class == api::SYS_RESUME {
            self.halted = false;
        } else if class == api::SYS_RESET {
            self.reset();
        } else if class == api::DEV_ASSIGN {
            if let Some(&device) = frame.data.first() {
                if self.button_pressed && (1..=MAX_DEVICE).contains(&device) {
                    self.device = device;
                    self.button_pressed = false;
                }
            }
        } else if class == api::UPDATE && frame.data.first() == Some(&self.device) {
            self.mode = PeerMode::BootLoader;
        }
    }

    fn boot_loader(&mut self, frame: &Frame, replies: &mut Vec<Frame>) {
        let id = frame.id;
        if !id.is_update_class() {
            return;
        }
        let acknowledged = if id == api::UPD_PING {
            true
        } else if id == api::UPD_DOWNLOAD {
            match (read_u32(&frame.data), frame.data.get(4..).map(read_u32)) {
                (Ok(address), Some(Ok(size))) => {
                    self.download = Some(Download {
                        address,
                        size,
                        image: Vec::with_capacity(size as usize),
                    });
                    true
                }
                _ => false,
            }
        } else if id == api::UPD_SEND_DATA {
            match self.download.as_mut() {
                Some(download) if download.image.len() < download.size as usize => {
                    download.image.extend_from_slice(&frame.data);
                    true
                }
                _ => false,
            }
        } else if id == api::UPD_RESET {
            if let Some(download) = self.download.take() {
                self.last_image = Some(download.image);
            }
            self.reset();
            false
        } else {
            false
        };

        if acknowledged {
            reply(replies, api::UPD_ACK, &[]);
        }
    }

    fn reset(&mut self) {
        self.mode = PeerMode::Application;
        self.power_flags |= FLAG_POWER_ON_RESET;
        self.halted = false;
        self.status = PeerStatus {
            vbus: self.status.vbus,
            temperature: self.status.temperature,
            ..PeerStatus::default()
        };
    }

    fn read_status(&self, class: MessageId) -> Option<Payload> {
        let status = &self.status;
        let bytes: Payload = if class == api::STATUS_VOUT {
            Payload::from_slice(&status.vout.to_le_bytes()).ok()?
        } else if class == api::STATUS_VBUS {
            Payload::from_slice(&status.vbus.to_le_bytes()).ok()?
        } else if class == api::STATUS_CURRENT {
            Payload::from_slice(&status.current.to_le_bytes()).ok()?
        } else if class == api::STATUS_TEMP {
            Payload::from_slice(&status.temperature.to_le_bytes()).ok()?
        } else if class == api::STATUS_POS {
            Payload::from_slice(&status.position.to_le_bytes()).ok()?
        } else if class == api::STATUS_SPD {
            Payload::from_slice(&status.speed.to_le_bytes()).ok()?
        } else if class == api::STATUS_LIMIT {
            Payload::from_slice(&[status.limit]).ok()?
        } else if class == api::STATUS_FAULT {
            Payload::from_slice(&status.fault.to_le_bytes()).ok()?
        } else {
            return None;
        };
        Some(bytes)
    }

    fn write(&mut self, class: MessageId, value: Payload) {
        if class == api::VOLT_SET {
            if let Ok(raw) = read_u16(&value) {
                self.status.vout = raw as i16;
            }
        }
        match self.parameters.iter_mut().find(|(stored, _)| *stored == class) {
            Some((_, stored)) => *stored = value,
            None => self.parameters.push((class, value)),
        }
    }

    /// Mode enable/disable and other argument-less commands.
    fn mode_change(&self, class: MessageId) -> bool {
        [
            api::VOLT_EN,
            api::VOLT_DIS,
            api::SPD_EN,
            api::SPD_DIS,
            api::VCOMP_EN,
            api::VCOMP_DIS,
            api::POS_EN,
            api::POS_DIS,
            api::ICTRL_EN,
            api::ICTRL_DIS,
        ]
        .contains(&class)
    }
}

fn reply(replies: &mut Vec<Frame>, id: MessageId, data: &[u8]) {
    if let Ok(frame) = Frame::data(id, data) {
        replies.push(frame);
    }
}
