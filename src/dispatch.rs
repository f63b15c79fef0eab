//! Inbound frame classification.
//!
//! Every received frame is keyed on its class and on whether its device
//! number matches the current target. Status replies update the status block
//! and chain the next poll; echoes and acknowledgements retire the command in
//! flight.

use crate::bus::BusEvent;
use crate::engine::Engine;
use crate::protocol::{api, read_u16, read_u32, read_u8, Frame, MessageId, ProtocolError};
use crate::scheduler::EngineState;
use crate::status::{StatusBlock, StatusKind};
use tracing::{debug, trace};

impl Engine {
    pub(crate) fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::TransmitComplete(id) => self.on_transmit_complete(id),
            BusEvent::Frame(frame) => {
                self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
                self.dispatch(&frame);
            }
        }
    }

    fn on_transmit_complete(&mut self, id: MessageId) {
        if self.scheduler.get_state() != EngineState::WaitForSend {
            return;
        }
        match self.queue.head() {
            Some(head) if head.id == id => {}
            _ => return,
        }

        let class = id.class();
        if (id.is_system() && class != api::FIRMWARE_VERSION) || id == api::UPD_RESET {
            debug!(%id, "sent, no acknowledgement expected");
            self.retire_in_flight();
        } else {
            let timeout = self.ack_timeout_for(id);
            self.scheduler.await_ack(timeout);
            trace!(%id, timeout, "sent, awaiting reply");
        }
    }

    fn dispatch(&mut self, frame: &Frame) {
        let class = frame.id.class();
        let device = frame.id.device();
        let from_target = device == self.target;
        trace!(id = %frame.id, len = frame.data.len(), "received");

        if class == api::ENUMERATE {
            self.presence.set(device);
            debug!(device, "enumeration reply");
            return;
        }

        match StatusKind::from_class(class) {
            Some(StatusKind::FirmwareVersion) => {
                self.on_firmware_version(frame, from_target);
                return;
            }
            Some(kind) => {
                self.on_status(kind, frame, from_target);
                return;
            }
            None => {}
        }

        if class == api::STATUS_POWER {
            self.deliver(frame);
        } else if api::is_parameter(class) {
            self.deliver(frame);
            self.retire_matching(frame.id);
        } else if class == api::ACK {
            self.retire_in_flight();
        } else if class == api::UPD_ACK {
            self.retire_in_flight();
            self.update_ack = true;
            trace!("boot loader acknowledged");
        } else {
            self.stats.frames_ignored = self.stats.frames_ignored.wrapping_add(1);
            trace!(id = %frame.id, "ignored");
        }
    }

    fn on_status(&mut self, kind: StatusKind, frame: &Frame, from_target: bool) {
        if from_target {
            if let Err(error) = decode_status(&mut self.status, kind, &frame.data) {
                trace!(id = %frame.id, %error, "short status reply ignored");
                return;
            }
        } else {
            self.status.invalidate(kind);
        }

        self.deliver(frame);
        if let Some(next) = kind.next() {
            self.queue_status_poll(next);
        }
    }

    fn on_firmware_version(&mut self, frame: &Frame, from_target: bool) {
        if from_target {
            match read_u32(&frame.data) {
                Ok(version) => self.status.firmware_version.set(version),
                Err(error) => {
                    trace!(%error, "short firmware version ignored");
                    return;
                }
            }
        } else {
            self.status.firmware_version.invalidate();
        }

        let query_in_flight = self
            .queue
            .head()
            .map_or(false, |head| head.id.class() == api::FIRMWARE_VERSION);
        if query_in_flight {
            self.retire_in_flight();
        }
    }

    /// Hand a reply to the in-flight read with the same identifier.
    fn deliver(&mut self, frame: &Frame) {
        if !self.scheduler.in_flight() {
            return;
        }
        if self.answered {
            return;
        }
        let ticket = match self.queue.head() {
            Some(head) if head.is_read() && head.id == frame.id => head.ticket,
            _ => None,
        };
        if let Some(ticket) = ticket {
            self.resolve_read(ticket, Ok(frame.data.clone()));
            self.answered = true;
        }
    }

    /// Echoes only close out the command they answer.
    fn retire_matching(&mut self, id: MessageId) {
        if self.queue.head().map_or(false, |head| head.id == id) {
            self.retire_in_flight();
        }
    }
}

fn decode_status(status: &mut StatusBlock, kind: StatusKind, data: &[u8]) -> Result<(), ProtocolError> {
    match kind {
        StatusKind::Vout => status.vout.set(read_u16(data)? as i16),
        StatusKind::Vbus => status.vbus.set(read_u16(data)?),
        StatusKind::Current => status.current.set(read_u16(data)? as i16),
        StatusKind::Temperature => status.temperature.set(read_u16(data)?),
        StatusKind::Position => status.position.set(read_u32(data)? as i32),
        StatusKind::Speed => status.speed.set(read_u32(data)? as i32),
        StatusKind::Limit => status.limit.set(read_u8(data)?),
        StatusKind::Fault => status.fault.set(read_u16(data)?),
        StatusKind::FirmwareVersion => status.firmware_version.set(read_u32(data)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::protocol::{Payload, MessageId};

    fn engine() -> Engine {
        Engine::new(EngineConfig { heartbeat: false, ..EngineConfig::default() })
    }

    fn frame(id: MessageId, data: &[u8]) -> BusEvent {
        BusEvent::Frame(Frame::data(id, data).unwrap())
    }

    #[test]
    fn test_decode_each_status_field() {
        let mut block = StatusBlock::new();
        decode_status(&mut block, StatusKind::Vout, &[0x00, 0x80]).unwrap();
        decode_status(&mut block, StatusKind::Position, &[0, 0, 2, 0]).unwrap();
        decode_status(&mut block, StatusKind::Limit, &[3]).unwrap();
        assert_eq!(block.vout.get(), (i16::MIN, true));
        assert_eq!(block.position.get(), (0x0002_0000, true));
        assert_eq!(block.limit.get(), (3, true));
    }

    #[test]
    fn test_short_status_is_rejected() {
        let mut block = StatusBlock::new();
        assert!(decode_status(&mut block, StatusKind::Speed, &[1, 2]).is_err());
        assert!(!block.speed.is_valid());
    }

    #[test]
    fn test_enumeration_reply_sets_presence() {
        let mut engine = engine();
        engine.handle_event(frame(api::ENUMERATE.with_device(9), &[]));
        assert!(engine.presence().contains(9));
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_status_reply_chains_next_poll() {
        let mut engine = engine();
        engine.handle_event(frame(api::STATUS_TEMP.with_device(1), &[0x00, 0x19]));
        assert_eq!(engine.temperature(), (0x1900, true));
        assert_eq!(engine.queue.head().map(|e| e.id), Some(api::STATUS_POS.with_device(1)));
    }

    #[test]
    fn test_fault_ends_chain() {
        let mut engine = engine();
        engine.handle_event(frame(api::STATUS_FAULT.with_device(1), &[1, 0]));
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_unsolicited_ack_does_not_retire() {
        let mut engine = engine();
        engine.enqueue(api::SPD_EN.with_device(1), Payload::new()).unwrap();
        engine.handle_event(frame(api::ACK.with_device(1), &[]));
        assert_eq!(engine.queue_len(), 1);
    }

    #[test]
    fn test_unknown_frame_is_counted() {
        let mut engine = engine();
        engine.handle_event(frame(MessageId::from_raw(0x0305_0000), &[1]));
        assert_eq!(engine.get_stats().frames_ignored, 1);
        assert_eq!(engine.get_stats().frames_received, 1);
    }
}
