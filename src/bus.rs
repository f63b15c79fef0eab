//! The hardware side of the engine.
//!
//! A [`CanBus`] is whatever moves frames on and off the wire: a CAN
//! controller driver on target, or [`crate::sim::SimBus`] on a host.

use crate::protocol::{Frame, MessageId};

/// Transmit buffers used by the engine.
///
/// Commands share a single slot so that only one is ever in flight. The
/// firmware-version query goes out as a remote frame on its own slot, and the
/// heartbeat has a slot of its own so it never disturbs the command in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mailbox {
    Command,
    Remote,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A frame received from a peer.
    Frame(Frame),
    /// The command slot finished putting `MessageId` on the wire.
    TransmitComplete(MessageId),
}

pub trait CanBus {
    /// Load `frame` into `mailbox` for transmission.
    fn transmit(&mut self, mailbox: Mailbox, frame: &Frame);

    /// Stop any pending transmission from `mailbox`.
    fn abort(&mut self, mailbox: Mailbox);

    /// Next pending receive or transmit-complete event, if any.
    fn receive(&mut self) -> Option<BusEvent>;
}

impl<B: CanBus + ?Sized> CanBus for &mut B {
    fn transmit(&mut self, mailbox: Mailbox, frame: &Frame) {
        (**self).transmit(mailbox, frame);
    }

    fn abort(&mut self, mailbox: Mailbox) {
        (**self).abort(mailbox);
    }

    fn receive(&mut self) -> Option<BusEvent> {
        (**self).receive()
    }
}
