//! # Motor Bus
//!
//! A CAN bus engine for a host that talks to brushed DC motor controllers on
//! a shared bus, with exactly one command in flight at a time.
//!
//! ## Features
//!
//! - **Single-in-flight transmit**: bounded command queue, send and
//!   acknowledgement timeouts counted in scheduler ticks
//! - **Status polling**: chained round-robin sweep of the target's measured
//!   quantities, each with a validity flag
//! - **Enumeration and assignment**: broadcast discovery into a presence
//!   bitmap, device-number claims with a cancellable window
//! - **Parameter reads**: zero-length requests correlated with their echo
//! - **Firmware update**: boot-loader download with progress reporting
//! - **Simulation**: a loopback bus of simulated controllers for tests and
//!   the `motorbus-sim` binary
//! - **Embedded-friendly engine**: fixed-size queue, payloads and tables
//!
//! ## Quick Start
//!
//! ```rust
//! use motorbus::{split, Engine, EngineConfig, SimBus};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let (handle, mut dispatcher) = split(engine, SimBus::with_devices(&[1, 2]));
//!
//! std::thread::spawn(move || loop {
//!     dispatcher.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! });
//!
//! let present = handle.enumerate().unwrap();
//! assert_eq!(&present.devices()[..], &[1, 2]);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - identifiers, API classes, frames
//! - [`command`] - typed commands and their encoding
//! - [`queue`] - outbound command ring
//! - [`scheduler`] - transmit state machine and tick timers
//! - [`engine`] - the engine object tying everything together
//! - [`status`] - status fields, presence bitmap, snapshots
//! - [`handle`] - blocking foreground API and the dispatcher
//! - [`update`] - firmware download
//! - [`sim`] - simulated controllers

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bus;
pub mod command;
pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod handle;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod sim;
pub mod status;
pub mod update;

// Re-export main public types for convenience
pub use bus::{BusEvent, CanBus, Mailbox};
pub use command::Command;
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineStats, ReadSlot};
pub use error::{BusError, ReadError};
pub use handle::{split, AssignOutcome, BusHandle, CancelToken, Dispatcher};
pub use protocol::{api, Frame, FrameKind, MessageId, Payload, ProtocolError};
pub use queue::{QueueFull, ReadTicket};
pub use scheduler::EngineState;
pub use sim::{SimBus, SimPeer};
pub use status::{PresenceBitmap, StatusBlock, StatusKind, StatusSnapshot};
pub use update::{FirmwareImage, UpdateError, UpdateProgress};
