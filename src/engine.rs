use crate::bus::{CanBus, Mailbox};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{BusError, ReadError};
use crate::protocol::{api, Frame, FrameKind, MessageId, Payload, MAX_DEVICE};
use crate::queue::{MessageQueue, QueueEntry, QueueFull, QueueStats, ReadTicket, QUEUE_SIZE};
use crate::scheduler::{EngineState, SchedulerStats, TransmitScheduler};
use crate::status::{PresenceBitmap, StatusBlock, StatusKind, StatusSnapshot};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, info, trace, warn};

/// Size of the read-slot table. Matches the queue so every queued read can
/// own a slot.
pub const READ_SLOTS: usize = QUEUE_SIZE;

const_assert!(READ_SLOTS <= u8::MAX as usize);

// Bound on load/drain rounds in one service pass.
const MAX_LOADS_PER_PASS: usize = QUEUE_SIZE * 4;

/// Closed enumeration windows whose bitmaps stay retrievable by round.
pub const ENUMERATION_HISTORY: usize = 8;

const_assert!(ENUMERATION_HISTORY.is_power_of_two());

/// Outcome of one parameter read, written exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSlot {
    Free,
    Pending,
    Complete(Payload),
    Failed(ReadError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub queue: QueueStats,
    pub scheduler: SchedulerStats,
    pub frames_received: u32,
    pub frames_ignored: u32,
    pub chained_polls_dropped: u32,
}

/// The whole bus engine: queue, transmit state machine, status store and
/// read correlation, owned by one value.
///
/// The engine never blocks. Time enters through [`Engine::tick`], inbound
/// traffic through [`Engine::poll`]; both take the bus they should drive.
#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) queue: MessageQueue,
    pub(crate) scheduler: TransmitScheduler,
    pub(crate) status: StatusBlock,
    pub(crate) presence: PresenceBitmap,
    // Bitmap of each closed window, indexed by round.
    pub(crate) enumeration_results: [PresenceBitmap; ENUMERATION_HISTORY],
    // ENUMERATE entries ever accepted into the queue.
    pub(crate) enumerations_queued: u32,
    pub(crate) reads: [ReadSlot; READ_SLOTS],
    pub(crate) target: u8,
    pub(crate) can_read: bool,
    pub(crate) polling: bool,
    pub(crate) update_ack: bool,
    // The in-flight read already has its result.
    pub(crate) answered: bool,
    pub(crate) stats: EngineStats,
}

impl Engine {
    /// Build an idle engine. An out-of-range initial target falls back to
    /// device 1; zero timeouts behave as one tick.
    pub fn new(config: EngineConfig) -> Self {
        let target = if (1..=MAX_DEVICE).contains(&config.initial_target) {
            config.initial_target
        } else {
            1
        };
        Self {
            scheduler: TransmitScheduler::new(config.sweep_period_ticks),
            queue: MessageQueue::new(),
            status: StatusBlock::new(),
            presence: PresenceBitmap::new(),
            enumeration_results: [PresenceBitmap::new(); ENUMERATION_HISTORY],
            enumerations_queued: 0,
            reads: core::array::from_fn(|_| ReadSlot::Free),
            target,
            can_read: false,
            polling: config.status_polling,
            update_ack: false,
            answered: false,
            stats: EngineStats::default(),
            config,
        }
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Append a raw entry to the outbound queue.
    pub fn enqueue(&mut self, id: MessageId, payload: Payload) -> Result<(), QueueFull> {
        self.queue.push(QueueEntry::new(id, payload))?;
        if id == api::ENUMERATE {
            self.enumerations_queued = self.enumerations_queued.wrapping_add(1);
        }
        Ok(())
    }

    /// Encode `command` for the current target and queue it.
    pub fn send(&mut self, command: &Command) -> Result<(), BusError> {
        let (id, payload) = command.encode(self.target)?;
        trace!(%id, ?command, "queueing command");
        self.enqueue(id, payload)?;
        Ok(())
    }

    /// Select the controller that status polls, reads and device-scoped
    /// commands address. Every status field is invalidated and a firmware
    /// version query is queued; read capability is re-derived later from the
    /// reply.
    pub fn set_target_address(&mut self, device: u8) -> Result<(), BusError> {
        if !(1..=MAX_DEVICE).contains(&device) {
            return Err(BusError::InvalidAddress(device));
        }
        debug!(device, "selecting target");
        self.target = device;
        self.can_read = false;
        self.status.invalidate_all();
        self.send(&Command::FirmwareVersion)
    }

    /// Device number of the selected controller.
    pub fn target(&self) -> u8 {
        self.target
    }

    /// Re-derive read capability from the firmware version on record.
    pub fn refresh_read_capability(&mut self) -> bool {
        let (version, valid) = self.status.firmware_version.get();
        self.can_read = valid && version > self.config.read_capable_firmware;
        self.can_read
    }

    /// Whether the target's firmware answers parameter reads.
    pub fn can_read(&self) -> bool {
        self.can_read
    }

    /// Broadcast a discovery request and return its round number.
    ///
    /// The presence bitmap is cleared when the request is loaded and fills in
    /// during the settling window that follows. Once that window closes, its
    /// bitmap is available from [`Engine::enumeration_result`].
    pub fn enumerate(&mut self) -> Result<u32, QueueFull> {
        self.enqueue(api::ENUMERATE, Payload::new())?;
        Ok(self.enumerations_queued)
    }

    /// Replies collected so far by the current or most recent window.
    pub fn presence(&self) -> PresenceBitmap {
        self.presence
    }

    /// Settling windows closed since start; bumps once per enumeration.
    pub fn enumeration_rounds(&self) -> u32 {
        self.scheduler.enumeration_rounds()
    }

    /// The bitmap of enumeration `round`, once its window has closed.
    ///
    /// Rounds that have fallen out of the history report the latest closed
    /// window instead.
    pub fn enumeration_result(&self, round: u32) -> Option<PresenceBitmap> {
        let closed = self.scheduler.enumeration_rounds();
        let behind = closed.wrapping_sub(round);
        if round == 0 || (behind as i32) < 0 {
            return None;
        }
        let round = if behind as usize >= ENUMERATION_HISTORY { closed } else { round };
        Some(self.enumeration_results[round as usize % ENUMERATION_HISTORY])
    }

    fn record_enumeration(&mut self) {
        let round = self.scheduler.enumeration_rounds();
        self.enumeration_results[round as usize % ENUMERATION_HISTORY] = self.presence;
        info!(round, devices = self.presence.count(), "enumeration window closed");
    }

    /// Broadcast a device-number claim; the controller whose button is
    /// pressed within the acceptance window adopts `device`.
    pub fn assign(&mut self, device: u8) -> Result<(), BusError> {
        if !(1..=MAX_DEVICE).contains(&device) {
            return Err(BusError::InvalidAddress(device));
        }
        self.send(&Command::Assign { device })
    }

    /// Queue a zero-length read of `class` on the current target.
    pub fn begin_read(&mut self, class: MessageId) -> Result<ReadTicket, ReadError> {
        let class = class.class();
        if !self.can_read && class != api::STATUS_POWER {
            return Err(ReadError::CapabilityDenied);
        }
        let index = self
            .reads
            .iter()
            .position(|slot| *slot == ReadSlot::Free)
            .ok_or(ReadError::NoFreeSlot)?;
        let ticket = ReadTicket(index as u8);
        self.queue.push(QueueEntry::read(class.with_device(self.target), ticket))?;
        self.reads[index] = ReadSlot::Pending;
        trace!(%class, slot = index, "read queued");
        Ok(ticket)
    }

    /// Collect a finished read. `None` while the request is still pending;
    /// the slot is released once a result is returned.
    pub fn poll_read(&mut self, ticket: ReadTicket) -> Option<Result<Payload, ReadError>> {
        let slot = self.reads.get_mut(usize::from(ticket.0))?;
        match core::mem::replace(slot, ReadSlot::Free) {
            ReadSlot::Pending => {
                *slot = ReadSlot::Pending;
                None
            }
            ReadSlot::Free => Some(Err(ReadError::Stale)),
            ReadSlot::Complete(payload) => Some(Ok(payload)),
            ReadSlot::Failed(error) => Some(Err(error)),
        }
    }

    /// Give up on a read whose caller will never collect it.
    pub(crate) fn release_read(&mut self, ticket: ReadTicket) {
        if let Some(slot) = self.reads.get_mut(usize::from(ticket.0)) {
            *slot = ReadSlot::Free;
        }
    }

    pub(crate) fn resolve_read(&mut self, ticket: ReadTicket, outcome: Result<Payload, ReadError>) {
        if let Some(slot) = self.reads.get_mut(usize::from(ticket.0)) {
            if *slot == ReadSlot::Pending {
                *slot = match outcome {
                    Ok(payload) => ReadSlot::Complete(payload),
                    Err(error) => ReadSlot::Failed(error),
                };
            }
        }
    }

    /// Every status field with its validity flag.
    pub fn status(&self) -> &StatusBlock {
        &self.status
    }

    /// Status in engineering units; invalid fields are `None`.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot(self.target)
    }

    /// Output voltage as a signed fraction of full scale.
    pub fn vout(&self) -> (i16, bool) {
        self.status.vout.get()
    }

    /// Bus voltage, unsigned 8.8 volts.
    pub fn vbus(&self) -> (u16, bool) {
        self.status.vbus.get()
    }

    /// Motor current, signed 8.8 amps.
    pub fn current(&self) -> (i16, bool) {
        self.status.current.get()
    }

    /// Controller temperature, unsigned 8.8 degrees Celsius.
    pub fn temperature(&self) -> (u16, bool) {
        self.status.temperature.get()
    }

    /// Position, signed 16.16 revolutions.
    pub fn position(&self) -> (i32, bool) {
        self.status.position.get()
    }

    /// Speed, signed 16.16 revolutions per minute.
    pub fn speed(&self) -> (i32, bool) {
        self.status.speed.get()
    }

    /// Limit switch bits.
    pub fn limit(&self) -> (u8, bool) {
        self.status.limit.get()
    }

    /// Latched fault bits.
    pub fn fault(&self) -> (u16, bool) {
        self.status.fault.get()
    }

    /// Firmware version reported by the target.
    pub fn firmware_version(&self) -> (u32, bool) {
        self.status.firmware_version.get()
    }

    /// Start the periodic status sweep on the next sweep tick.
    pub fn enable_status_polling(&mut self) {
        self.polling = true;
    }

    pub fn disable_status_polling(&mut self) {
        self.polling = false;
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// Consume the one-shot boot-loader acknowledgement.
    pub fn take_update_ack(&mut self) -> bool {
        core::mem::take(&mut self.update_ack)
    }

    pub fn update_ack(&self) -> bool {
        self.update_ack
    }

    /// Stage of the single command slot.
    pub fn get_state(&self) -> EngineState {
        self.scheduler.get_state()
    }

    /// Ticks since the engine was built.
    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }

    /// Entries outstanding, the one in flight included.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_settling(&self) -> bool {
        self.scheduler.is_settling()
    }

    /// Queue, scheduler and dispatcher counters.
    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            queue: self.queue.stats(),
            scheduler: *self.scheduler.get_stats(),
            ..self.stats
        }
    }

    /// One timer tick: sweep and settling timers, then a full service pass
    /// that also counts down the in-flight command.
    pub fn tick<B: CanBus>(&mut self, bus: &mut B) {
        let outcome = self.scheduler.on_tick();
        if outcome.enumeration_closed {
            self.record_enumeration();
        }
        if outcome.sweep_due {
            if self.config.heartbeat {
                self.scheduler.request_heartbeat();
            }
            if self.polling {
                self.queue_status_poll(StatusKind::Vout);
            }
        }
        self.service(bus, true);
    }

    /// Handle pending bus events and load the next command, without
    /// advancing time.
    pub fn poll<B: CanBus>(&mut self, bus: &mut B) {
        self.service(bus, false);
    }

    fn service<B: CanBus>(&mut self, bus: &mut B, timed: bool) {
        self.drain(bus);
        if timed {
            self.expire(bus);
        }
        if self.scheduler.take_heartbeat() {
            let heartbeat = Frame {
                id: api::HEARTBEAT,
                kind: FrameKind::Data,
                data: Payload::new(),
            };
            bus.transmit(Mailbox::Heartbeat, &heartbeat);
        }
        for _ in 0..MAX_LOADS_PER_PASS {
            if !self.load_next(bus) {
                break;
            }
            self.drain(bus);
        }
    }

    fn drain<B: CanBus>(&mut self, bus: &mut B) {
        while let Some(event) = bus.receive() {
            self.handle_event(event);
        }
    }

    /// Move the head entry into the transmit slot when the scheduler allows.
    fn load_next<B: CanBus>(&mut self, bus: &mut B) -> bool {
        if !self.scheduler.can_load() {
            return false;
        }
        let Some(entry) = self.queue.head() else {
            return false;
        };
        let id = entry.id;
        let frame = Frame {
            id,
            kind: FrameKind::Data,
            data: entry.payload.clone(),
        };

        if id == api::ENUMERATE {
            self.presence.clear();
            self.scheduler.start_settling(self.config.settling_ticks);
            info!(window = self.config.settling_ticks, "enumerating devices");
            if !self.scheduler.is_settling() {
                self.record_enumeration();
            }
        }
        if id.is_update_class() {
            self.update_ack = false;
        }

        if id.class() == api::FIRMWARE_VERSION {
            bus.transmit(Mailbox::Remote, &Frame::remote(id));
        } else {
            bus.transmit(Mailbox::Command, &frame);
        }
        self.scheduler.begin_send(self.config.send_timeout_ticks);
        self.answered = false;
        trace!(%id, "loaded");
        true
    }

    /// Count down the in-flight entry and give up on it at zero.
    fn expire<B: CanBus>(&mut self, bus: &mut B) {
        let Some(expired) = self.scheduler.expire() else {
            return;
        };
        let Some(entry) = self.queue.retire() else {
            return;
        };

        if entry.id.class() == api::FIRMWARE_VERSION {
            bus.abort(Mailbox::Remote);
        } else {
            bus.abort(Mailbox::Command);
        }
        if let Some(kind) = StatusKind::from_class(entry.id.class()) {
            self.status.invalidate(kind);
        }

        let error = match expired {
            EngineState::WaitForSend => ReadError::SendTimeout,
            _ => ReadError::AckTimeout,
        };
        if let (Some(ticket), false) = (entry.ticket, self.answered) {
            self.resolve_read(ticket, Err(error));
        }
        warn!(id = %entry.id, state = ?expired, "command timed out");
    }

    /// Countdown for the wait that follows a completed transmission.
    pub(crate) fn ack_timeout_for(&self, id: MessageId) -> u32 {
        if id == api::UPD_PING || id == api::UPD_DOWNLOAD || id == api::UPD_SEND_DATA {
            self.config.update_timeout_ticks
        } else {
            self.config.ack_timeout_ticks
        }
    }

    /// End the in-flight entry's life cycle. A read still pending at this
    /// point was acknowledged without data.
    pub(crate) fn retire_in_flight(&mut self) -> bool {
        if !self.scheduler.in_flight() {
            return false;
        }
        if let Some(entry) = self.queue.retire() {
            if let (Some(ticket), false) = (entry.ticket, self.answered) {
                self.resolve_read(ticket, Err(ReadError::NoData));
            }
            trace!(id = %entry.id, "retired");
        }
        self.scheduler.complete();
        true
    }

    /// Queue a status poll for the current target, dropping it when the
    /// queue is full.
    pub(crate) fn queue_status_poll(&mut self, kind: StatusKind) {
        let id = kind.class().with_device(self.target);
        if self.enqueue(id, Payload::new()).is_err() {
            self.stats.chained_polls_dropped = self.stats.chained_polls_dropped.wrapping_add(1);
            warn!(%id, "queue full, status poll dropped");
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusEvent;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Loopback {
        sent: Vec<(Mailbox, Frame)>,
        events: VecDeque<BusEvent>,
    }

    impl CanBus for Loopback {
        fn transmit(&mut self, mailbox: Mailbox, frame: &Frame) {
            self.sent.push((mailbox, frame.clone()));
        }

        fn abort(&mut self, _mailbox: Mailbox) {}

        fn receive(&mut self) -> Option<BusEvent> {
            self.events.pop_front()
        }
    }

    fn quiet() -> EngineConfig {
        EngineConfig { heartbeat: false, ..EngineConfig::default() }
    }

    #[test]
    fn test_engine_creation() {
        let engine = Engine::new(quiet());
        assert_eq!(engine.get_state(), EngineState::Idle);
        assert_eq!(engine.target(), 1);
        assert!(!engine.can_read());
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_send_loads_immediately() {
        let mut engine = Engine::new(quiet());
        let mut bus = Loopback::default();
        engine.send(&Command::SpeedModeEnable).unwrap();
        engine.poll(&mut bus);
        assert_eq!(engine.get_state(), EngineState::WaitForSend);
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].1.id, api::SPD_EN.with_device(1));
    }

    #[test]
    fn test_firmware_query_uses_remote_mailbox() {
        let mut engine = Engine::new(quiet());
        let mut bus = Loopback::default();
        engine.set_target_address(4).unwrap();
        engine.poll(&mut bus);
        assert_eq!(bus.sent[0].0, Mailbox::Remote);
        assert_eq!(bus.sent[0].1.kind, FrameKind::Remote);
        assert_eq!(bus.sent[0].1.id, api::FIRMWARE_VERSION.with_device(4));
    }

    #[test]
    fn test_invalid_target_rejected() {
        let mut engine = Engine::new(quiet());
        assert_eq!(engine.set_target_address(0), Err(BusError::InvalidAddress(0)));
        assert_eq!(engine.set_target_address(64), Err(BusError::InvalidAddress(64)));
        assert_eq!(engine.assign(0), Err(BusError::InvalidAddress(0)));
        assert_eq!(engine.target(), 1);
    }

    #[test]
    fn test_read_denied_without_capability() {
        let mut engine = Engine::new(quiet());
        assert_eq!(engine.begin_read(api::SPD_PC), Err(ReadError::CapabilityDenied));
        assert!(engine.begin_read(api::STATUS_POWER).is_ok());
    }

    #[test]
    fn test_read_slots_exhaust() {
        let mut engine = Engine::new(quiet());
        engine.can_read = true;
        for _ in 0..QUEUE_SIZE - 1 {
            engine.begin_read(api::SPD_PC).unwrap();
        }
        assert_eq!(engine.begin_read(api::SPD_PC), Err(ReadError::QueueFull));
    }

    #[test]
    fn test_poll_read_releases_slot() {
        let mut engine = Engine::new(quiet());
        let ticket = engine.begin_read(api::STATUS_POWER).unwrap();
        assert_eq!(engine.poll_read(ticket), None);
        engine.resolve_read(ticket, Ok(Payload::new()));
        assert_eq!(engine.poll_read(ticket), Some(Ok(Payload::new())));
        assert_eq!(engine.poll_read(ticket), Some(Err(ReadError::Stale)));
    }

    #[test]
    fn test_heartbeat_every_sweep() {
        let mut engine = Engine::default();
        let mut bus = Loopback::default();
        for _ in 0..80 {
            engine.tick(&mut bus);
        }
        let heartbeats = bus.sent.iter().filter(|(mailbox, _)| *mailbox == Mailbox::Heartbeat).count();
        assert_eq!(heartbeats, 2);
        assert_eq!(engine.get_stats().scheduler.heartbeats, 2);
    }

    #[test]
    fn test_polling_queues_first_status() {
        let mut engine = Engine::new(EngineConfig { status_polling: true, ..quiet() });
        let mut bus = Loopback::default();
        for _ in 0..40 {
            engine.tick(&mut bus);
        }
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].1.id, api::STATUS_VOUT.with_device(1));
    }

    #[test]
    fn test_update_ack_is_one_shot() {
        let mut engine = Engine::new(quiet());
        engine.update_ack = true;
        assert!(engine.take_update_ack());
        assert!(!engine.take_update_ack());
    }
}
