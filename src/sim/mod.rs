//! A loopback bus populated with simulated motor controllers.
//!
//! Frames transmitted on a [`SimBus`] are shown to every attached
//! [`SimPeer`] immediately, and their replies are queued for the engine to
//! receive, after the transmit-complete event for the frame that caused them.

pub mod peer;

pub use peer::{Download, PeerMode, PeerStatus, SimPeer};

use crate::bus::{BusEvent, CanBus, Mailbox};
use crate::protocol::{Frame, FrameKind};
use std::collections::VecDeque;
use tracing::trace;

/// Transmitted frames kept for inspection.
pub const LOG_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Node {
    peer: SimPeer,
    attached: bool,
}

#[derive(Debug, Default)]
pub struct SimBus {
    nodes: Vec<Node>,
    pending: VecDeque<BusEvent>,
    log: VecDeque<(Mailbox, Frame)>,
    aborts: u32,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with one default controller per device number.
    pub fn with_devices(devices: &[u8]) -> Self {
        let mut bus = Self::new();
        for &device in devices {
            bus.add_peer(SimPeer::new(device));
        }
        bus
    }

    pub fn add_peer(&mut self, peer: SimPeer) {
        self.nodes.push(Node { peer, attached: true });
    }

    pub fn peer(&self, device: u8) -> Option<&SimPeer> {
        self.nodes.iter().map(|node| &node.peer).find(|peer| peer.device() == device)
    }

    pub fn peer_mut(&mut self, device: u8) -> Option<&mut SimPeer> {
        self.nodes.iter_mut().map(|node| &mut node.peer).find(|peer| peer.device() == device)
    }

    pub fn peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.nodes.iter().map(|node| &node.peer)
    }

    /// Disconnect a controller; it stops seeing and answering frames.
    pub fn detach(&mut self, device: u8) -> bool {
        self.set_attached(device, false)
    }

    pub fn attach(&mut self, device: u8) -> bool {
        self.set_attached(device, true)
    }

    fn set_attached(&mut self, device: u8, attached: bool) -> bool {
        match self.nodes.iter_mut().find(|node| node.peer.device() == device) {
            Some(node) => {
                node.attached = attached;
                true
            }
            None => false,
        }
    }

    /// Queue an arbitrary event, as if it had arrived from the wire.
    pub fn inject(&mut self, event: BusEvent) {
        self.pending.push_back(event);
    }

    /// Advance every controller's motor model.
    pub fn advance(&mut self, dt_ms: u16) {
        for node in &mut self.nodes {
            node.peer.update(dt_ms);
        }
    }

    pub fn sent(&self) -> impl Iterator<Item = &(Mailbox, Frame)> {
        self.log.iter()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn aborts(&self) -> u32 {
        self.aborts
    }
}

impl CanBus for SimBus {
    fn transmit(&mut self, mailbox: Mailbox, frame: &Frame) {
        trace!(?mailbox, id = %frame.id, "sim transmit");
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back((mailbox, frame.clone()));

        if mailbox == Mailbox::Command && frame.kind == FrameKind::Data {
            self.pending.push_back(BusEvent::TransmitComplete(frame.id));
        }

        let mut replies = Vec::new();
        for node in self.nodes.iter_mut().filter(|node| node.attached) {
            node.peer.receive(frame, &mut replies);
        }
        self.pending.extend(replies.into_iter().map(BusEvent::Frame));
    }

    fn abort(&mut self, mailbox: Mailbox) {
        trace!(?mailbox, "sim abort");
        self.aborts = self.aborts.wrapping_add(1);
    }

    fn receive(&mut self) -> Option<BusEvent> {
        self.pending.pop_front()
    }
}
