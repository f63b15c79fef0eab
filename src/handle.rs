//! Hosted concurrency split.
//!
//! [`split`] turns an [`Engine`] and a bus into a [`Dispatcher`], which runs
//! in the timer or receive context, and any number of [`BusHandle`]s used by
//! foreground code. Foreground calls that need an answer from the bus block
//! on a condition variable that the dispatcher signals after every pass.

use crate::bus::CanBus;
use crate::command::Command;
use crate::engine::{Engine, EngineStats};
use crate::error::BusError;
use crate::protocol::{api, MessageId, Payload};
use crate::status::{PresenceBitmap, StatusBlock, StatusSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

// Power status byte 0 is nonzero after a power-on reset.
const POWER_ON_RESET: u8 = 0x01;
// Reference selector for the quadrature encoder.
const REFERENCE_ENCODER: u8 = 0;

struct Shared {
    engine: Mutex<Engine>,
    changed: Condvar,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `ready` yields a value. The lock is released while waiting.
    fn wait_until<T>(&self, mut ready: impl FnMut(&mut Engine) -> Option<T>) -> Result<T, BusError> {
        let mut engine = self.lock();
        loop {
            if let Some(value) = ready(&mut engine) {
                return Ok(value);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Disconnected);
            }
            engine = self.changed.wait(engine).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Wrap `engine` and `bus` for use from several threads.
pub fn split<B: CanBus>(engine: Engine, bus: B) -> (BusHandle, Dispatcher<B>) {
    let shared = Arc::new(Shared {
        engine: Mutex::new(engine),
        changed: Condvar::new(),
        closed: AtomicBool::new(false),
    });
    let handle = BusHandle { shared: Arc::clone(&shared) };
    (handle, Dispatcher { shared, bus })
}

/// The interrupt side: owns the bus and drives the engine.
pub struct Dispatcher<B> {
    shared: Arc<Shared>,
    bus: B,
}

impl<B: CanBus> Dispatcher<B> {
    /// Timer interrupt; call once per tick period.
    pub fn tick(&mut self) {
        self.shared.lock().tick(&mut self.bus);
        self.shared.changed.notify_all();
    }

    /// Receive interrupt; call whenever the bus has events pending.
    pub fn poll(&mut self) {
        self.shared.lock().poll(&mut self.bus);
        self.shared.changed.notify_all();
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.changed.notify_all();
    }
}

/// Cancels a pending [`BusHandle::assign`] window from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The acceptance window ran out.
    Completed,
    Cancelled,
}

/// Foreground API. Must not be used from the dispatcher's thread while it is
/// inside `tick` or `poll`.
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl BusHandle {
    /// Run `f` against the engine under the lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        f(&mut self.shared.lock())
    }

    pub fn enqueue(&self, id: MessageId, payload: Payload) -> Result<(), BusError> {
        Ok(self.shared.lock().enqueue(id, payload)?)
    }

    pub fn send(&self, command: &Command) -> Result<(), BusError> {
        self.shared.lock().send(command)
    }

    /// Read `class` from the target and wait for the answer.
    pub fn read_parameter(&self, class: MessageId) -> Result<Payload, BusError> {
        let ticket = self.shared.lock().begin_read(class)?;
        match self.shared.wait_until(|engine| engine.poll_read(ticket)) {
            Ok(outcome) => Ok(outcome?),
            Err(error) => {
                self.shared.lock().release_read(ticket);
                Err(error)
            }
        }
    }

    /// Select a new target, learn its firmware version and read capability,
    /// and bring a freshly powered controller into a known state.
    pub fn set_target_address(&self, device: u8) -> Result<(), BusError> {
        self.shared.lock().set_target_address(device)?;

        let power = self.read_parameter(api::STATUS_POWER)?;
        let capable = self.shared.lock().refresh_read_capability();
        debug!(device, capable, "target selected");

        if power.first().map_or(false, |flags| flags & POWER_ON_RESET != 0) {
            info!(device, "controller was power cycled, restoring defaults");
            let ramp = self.shared.lock().config().default_voltage_ramp;
            self.send(&Command::StatusPowerClear)?;
            self.send(&Command::VoltageRampSet { ramp })?;
            self.send(&Command::SpeedRefSet { reference: REFERENCE_ENCODER })?;
            self.send(&Command::PositionRefSet { reference: REFERENCE_ENCODER })?;
            self.read_parameter(api::STATUS_POWER)?;
        }
        Ok(())
    }

    /// Discover devices and return the ones that answered within the
    /// settling window.
    pub fn enumerate(&self) -> Result<PresenceBitmap, BusError> {
        let round = self.shared.lock().enumerate()?;
        self.shared.wait_until(|engine| engine.enumeration_result(round))
    }

    /// Broadcast a device-number claim and hold the acceptance window open
    /// until it expires or `cancel` fires.
    pub fn assign(&self, device: u8, cancel: &CancelToken) -> Result<AssignOutcome, BusError> {
        let deadline = {
            let mut engine = self.shared.lock();
            engine.assign(device)?;
            engine.ticks() + u64::from(engine.config().assign_window_ticks)
        };
        info!(device, "assignment window open");
        self.shared.wait_until(|engine| {
            if cancel.is_cancelled() {
                Some(AssignOutcome::Cancelled)
            } else if engine.ticks() >= deadline {
                Some(AssignOutcome::Completed)
            } else {
                None
            }
        })
    }

    /// Block for `ticks` dispatcher ticks.
    pub fn wait_ticks(&self, ticks: u32) -> Result<(), BusError> {
        let deadline = self.shared.lock().ticks() + u64::from(ticks);
        self.shared.wait_until(|engine| (engine.ticks() >= deadline).then_some(()))
    }

    /// Wait up to `ticks` for a boot-loader acknowledgement. Returns whether
    /// one arrived.
    pub fn wait_update_ack(&self, ticks: u32) -> Result<bool, BusError> {
        let deadline = self.shared.lock().ticks() + u64::from(ticks);
        self.shared.wait_until(|engine| {
            if engine.take_update_ack() {
                Some(true)
            } else if engine.ticks() >= deadline {
                Some(false)
            } else {
                None
            }
        })
    }

    pub fn target(&self) -> u8 {
        self.shared.lock().target()
    }

    pub fn can_read(&self) -> bool {
        self.shared.lock().can_read()
    }

    pub fn presence(&self) -> PresenceBitmap {
        self.shared.lock().presence()
    }

    pub fn status(&self) -> StatusBlock {
        self.shared.lock().status().clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn get_stats(&self) -> EngineStats {
        self.shared.lock().get_stats()
    }

    pub fn enable_status_polling(&self) {
        self.shared.lock().enable_status_polling();
    }

    pub fn disable_status_polling(&self) {
        self.shared.lock().disable_status_polling();
    }
}
