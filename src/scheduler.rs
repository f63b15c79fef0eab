use serde::{Deserialize, Serialize};

/// Life-cycle stage of the single command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    WaitForSend,
    WaitForAck,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_sent: u32,
    pub total_completed: u32,
    pub send_timeouts: u32,
    pub ack_timeouts: u32,
    pub enumerations: u32,
    pub heartbeats: u32,
}

/// What a tick changed besides the countdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// The sweep timer wrapped: time for a heartbeat and a status poll.
    pub sweep_due: bool,
    /// A settling window that followed an enumeration just closed.
    pub enumeration_closed: bool,
}

/// Owns the one transmit slot and every tick-driven timer.
#[derive(Debug)]
pub struct TransmitScheduler {
    state: EngineState,
    countdown: u32,
    settling: u32,
    enumerating: bool,
    sweep_period: u32,
    sweep_countdown: u32,
    heartbeat_due: bool,
    ticks: u64,
    enumeration_rounds: u32,
    stats: SchedulerStats,
}

impl TransmitScheduler {
    pub fn new(sweep_period: u32) -> Self {
        let sweep_period = sweep_period.max(1);
        Self {
            state: EngineState::Idle,
            countdown: 0,
            settling: 0,
            enumerating: false,
            sweep_period,
            sweep_countdown: sweep_period,
            heartbeat_due: false,
            ticks: 0,
            enumeration_rounds: 0,
            stats: SchedulerStats::default(),
        }
    }

    pub fn get_state(&self) -> EngineState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == EngineState::Idle
    }

    pub fn in_flight(&self) -> bool {
        !self.is_idle()
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn enumeration_rounds(&self) -> u32 {
        self.enumeration_rounds
    }

    pub fn is_settling(&self) -> bool {
        self.settling != 0
    }

    /// Idle, not settling: a new command may be loaded.
    pub fn can_load(&self) -> bool {
        self.is_idle() && !self.is_settling()
    }

    /// The head entry was loaded into the transmit slot. A zero timeout
    /// counts as one tick so the slot always frees up.
    pub fn begin_send(&mut self, timeout: u32) {
        debug_assert!(self.is_idle(), "loading while {:?}", self.state);
        self.state = EngineState::WaitForSend;
        self.countdown = timeout.max(1);
        self.stats.total_sent = self.stats.total_sent.wrapping_add(1);
    }

    /// The frame is on the wire; wait for the peer to answer.
    pub fn await_ack(&mut self, timeout: u32) {
        self.state = EngineState::WaitForAck;
        self.countdown = timeout.max(1);
    }

    /// The in-flight entry finished normally.
    pub fn complete(&mut self) {
        self.state = EngineState::Idle;
        self.countdown = 0;
        self.stats.total_completed = self.stats.total_completed.wrapping_add(1);
    }

    /// Hold off new transmissions for `ticks` to collect broadcast replies.
    pub fn start_settling(&mut self, ticks: u32) {
        self.settling = ticks;
        self.enumerating = true;
        self.stats.enumerations = self.stats.enumerations.wrapping_add(1);
        if ticks == 0 {
            self.close_enumeration();
        }
    }

    fn close_enumeration(&mut self) {
        self.enumerating = false;
        self.enumeration_rounds = self.enumeration_rounds.wrapping_add(1);
    }

    /// Advance the periodic timers by one tick. The command countdown is
    /// handled separately by [`TransmitScheduler::expire`].
    pub fn on_tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.ticks = self.ticks.wrapping_add(1);

        self.sweep_countdown -= 1;
        if self.sweep_countdown == 0 {
            self.sweep_countdown = self.sweep_period;
            outcome.sweep_due = true;
        }

        if self.settling != 0 {
            self.settling -= 1;
            if self.settling == 0 && self.enumerating {
                self.close_enumeration();
                outcome.enumeration_closed = true;
            }
        }

        outcome
    }

    /// Count one tick off the active countdown. Returns the state that timed
    /// out when it reaches zero while a command is in flight; the scheduler is
    /// then Idle.
    pub fn expire(&mut self) -> Option<EngineState> {
        if self.countdown == 0 {
            return None;
        }
        self.countdown -= 1;
        if self.countdown != 0 || self.is_idle() {
            return None;
        }

        let expired = self.state;
        match expired {
            EngineState::WaitForSend => self.stats.send_timeouts += 1,
            EngineState::WaitForAck => self.stats.ack_timeouts += 1,
            EngineState::Idle => {}
        }
        self.state = EngineState::Idle;
        Some(expired)
    }

    pub fn request_heartbeat(&mut self) {
        self.heartbeat_due = true;
    }

    /// Consume a pending heartbeat request, unless a settling window holds
    /// the bus.
    pub fn take_heartbeat(&mut self) -> bool {
        if self.heartbeat_due && !self.is_settling() {
            self.heartbeat_due = false;
            self.stats.heartbeats = self.stats.heartbeats.wrapping_add(1);
            return true;
        }
        false
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = TransmitScheduler::new(40);
        assert_eq!(scheduler.get_state(), EngineState::Idle);
        assert!(scheduler.can_load());
        assert_eq!(scheduler.ticks(), 0);
    }

    #[test]
    fn test_send_timeout_after_exact_ticks() {
        let mut scheduler = TransmitScheduler::new(40);
        scheduler.begin_send(2);
        assert_eq!(scheduler.expire(), None);
        assert_eq!(scheduler.get_state(), EngineState::WaitForSend);
        assert_eq!(scheduler.expire(), Some(EngineState::WaitForSend));
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.get_stats().send_timeouts, 1);
    }

    #[test]
    fn test_ack_timeout_after_exact_ticks() {
        let mut scheduler = TransmitScheduler::new(40);
        scheduler.begin_send(2);
        scheduler.await_ack(5);
        for _ in 0..4 {
            assert_eq!(scheduler.expire(), None);
        }
        assert_eq!(scheduler.expire(), Some(EngineState::WaitForAck));
        assert_eq!(scheduler.get_stats().ack_timeouts, 1);
    }

    #[test]
    fn test_zero_timeouts_still_expire() {
        let mut scheduler = TransmitScheduler::new(40);
        scheduler.begin_send(0);
        assert_eq!(scheduler.expire(), Some(EngineState::WaitForSend));

        scheduler.begin_send(0);
        scheduler.await_ack(0);
        assert_eq!(scheduler.expire(), Some(EngineState::WaitForAck));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_completion_cancels_countdown() {
        let mut scheduler = TransmitScheduler::new(40);
        scheduler.begin_send(2);
        scheduler.complete();
        assert_eq!(scheduler.expire(), None);
        assert_eq!(scheduler.expire(), None);
        assert_eq!(scheduler.get_stats().total_completed, 1);
    }

    #[test]
    fn test_settling_blocks_loading() {
        let mut scheduler = TransmitScheduler::new(1000);
        scheduler.start_settling(3);
        assert!(!scheduler.can_load());
        assert!(!scheduler.on_tick().enumeration_closed);
        assert!(!scheduler.on_tick().enumeration_closed);
        assert!(scheduler.on_tick().enumeration_closed);
        assert!(scheduler.can_load());
        assert_eq!(scheduler.enumeration_rounds(), 1);
    }

    #[test]
    fn test_sweep_period() {
        let mut scheduler = TransmitScheduler::new(4);
        let due: Vec<bool> = (0..8).map(|_| scheduler.on_tick().sweep_due).collect();
        assert_eq!(due, vec![false, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_heartbeat_waits_for_settling() {
        let mut scheduler = TransmitScheduler::new(40);
        scheduler.request_heartbeat();
        scheduler.start_settling(1);
        assert!(!scheduler.take_heartbeat());
        scheduler.on_tick();
        assert!(scheduler.take_heartbeat());
        assert!(!scheduler.take_heartbeat());
    }
}
