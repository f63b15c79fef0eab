//! Firmware download to a controller's boot loader.

use crate::command::Command;
use crate::error::BusError;
use crate::handle::BusHandle;
use crate::protocol::{payload, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Largest image the controller's flash can take.
pub const MAX_IMAGE_SIZE: usize = 0x1_F000;
/// Flash address the application is linked at.
pub const LOAD_ADDRESS: u32 = 0x800;

const STARTUP_TICKS: u32 = 50;
const PING_ATTEMPTS: u32 = 10;
const PING_TICKS: u32 = 10;
const SETTLE_TICKS: u32 = 50;
const ERASE_TICKS: u32 = 4000;
const DATA_TICKS: u32 = 10;
const RESET_TICKS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("image of {0} bytes does not fit in flash")]
    TooLarge(usize),
    #[error("image of {0} bytes is too short to hold a vector table")]
    TooShort(usize),
    #[error("initial stack pointer {0:#010x} is not in SRAM")]
    InvalidStackPointer(u32),
    #[error("reset vector {0:#010x} is not a thumb address in flash")]
    InvalidResetVector(u32),
    #[error("boot loader did not answer")]
    NoBootLoader,
    #[error("flash erase was not acknowledged")]
    EraseTimeout,
    #[error("data at offset {offset:#x} was not acknowledged")]
    DataTimeout { offset: usize },
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A validated application image.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareImage<'a> {
    data: &'a [u8],
}

impl<'a> FirmwareImage<'a> {
    /// Check size and vector table: the initial stack pointer must be
    /// word-aligned in SRAM and the reset vector a thumb address below 1 MiB.
    pub fn new(data: &'a [u8]) -> Result<Self, UpdateError> {
        if data.len() > MAX_IMAGE_SIZE {
            return Err(UpdateError::TooLarge(data.len()));
        }
        let (sp, rv) = match data {
            [a, b, c, d, e, f, g, h, ..] => (
                u32::from_le_bytes([*a, *b, *c, *d]),
                u32::from_le_bytes([*e, *f, *g, *h]),
            ),
            _ => return Err(UpdateError::TooShort(data.len())),
        };
        if sp & 0xFFFF_0003 != 0x2000_0000 {
            return Err(UpdateError::InvalidStackPointer(sp));
        }
        if rv & 0xFFF0_0001 != 0x0000_0001 {
            return Err(UpdateError::InvalidResetVector(rv));
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProgress {
    pub sent: usize,
    pub total: usize,
}

impl UpdateProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.sent * 100) / self.total) as u8
    }
}

impl BusHandle {
    /// Download `image` to the current target and restart it.
    ///
    /// The controller is told to enter its boot loader, pinged until it
    /// answers, erased, programmed eight bytes at a time and reset. The
    /// target is then selected again so that its defaults are restored.
    pub fn update_firmware(
        &self,
        image: &FirmwareImage<'_>,
        mut progress: impl FnMut(UpdateProgress),
    ) -> Result<(), UpdateError> {
        let target = self.target();
        let total = image.len();
        info!(target, size = total, "starting firmware update");

        self.send(&Command::UpdateStart)?;
        self.wait_ticks(STARTUP_TICKS)?;

        self.ping_boot_loader()?;
        self.wait_ticks(SETTLE_TICKS)?;

        self.clear_update_ack();
        self.send(&Command::UpdateDownload {
            address: LOAD_ADDRESS,
            size: total as u32,
        })?;
        if !self.wait_update_ack(ERASE_TICKS)? {
            return Err(UpdateError::EraseTimeout);
        }
        debug!("flash erased");

        for (index, chunk) in image.as_bytes().chunks(MAX_PAYLOAD).enumerate() {
            let offset = index * MAX_PAYLOAD;
            self.clear_update_ack();
            let data = payload(chunk).map_err(BusError::from)?;
            self.send(&Command::UpdateSendData { data })?;
            if !self.wait_update_ack(DATA_TICKS)? {
                warn!(offset, "data chunk not acknowledged");
                return Err(UpdateError::DataTimeout { offset });
            }
            progress(UpdateProgress {
                sent: offset + chunk.len(),
                total,
            });
        }

        self.send(&Command::UpdateReset)?;
        self.wait_ticks(RESET_TICKS)?;
        info!(target, "firmware update complete");

        self.set_target_address(target)?;
        Ok(())
    }

    fn ping_boot_loader(&self) -> Result<(), UpdateError> {
        for attempt in 1..=PING_ATTEMPTS {
            self.clear_update_ack();
            self.send(&Command::UpdatePing)?;
            if self.wait_update_ack(PING_TICKS)? {
                debug!(attempt, "boot loader answered");
                return Ok(());
            }
        }
        warn!("boot loader did not answer {} pings", PING_ATTEMPTS);
        Err(UpdateError::NoBootLoader)
    }

    fn clear_update_ack(&self) {
        self.with_engine(|engine| engine.take_update_ack());
    }
}
