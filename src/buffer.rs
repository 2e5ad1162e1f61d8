use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::packet::Packet;

/// Result of applying an acknowledgement to an outbound buffer.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    /// Number of packets handed to the resend callback.
    pub resent: usize,
    /// Number of packets released from the front of the buffer.
    pub released: usize,
}

/// Packets kept in strictly ascending id order, lowest id at the front.
///
/// The same container backs both directions of a session: inbound packets are placed with
/// [`OrderedBuffer::insert_by_id`] as they arrive in any order, outbound packets are appended
/// with [`OrderedBuffer::push_back`] and retired with [`OrderedBuffer::acknowledge`].
#[derive(Debug, Default)]
pub struct OrderedBuffer {
    packets: VecDeque<Packet>,
}

impl OrderedBuffer {
    pub fn new() -> Self {
        Self {
            packets: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Lowest-id packet.
    pub fn front(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Highest-id packet.
    pub fn back(&self) -> Option<&Packet> {
        self.packets.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Appends a packet whose id is known to exceed every id in the buffer.
    pub fn push_back(&mut self, packet: Packet) -> Result<()> {
        if let Some(back) = self.back() {
            if packet.id() <= back.id() {
                return Err(Error::ProtocolConsistencyViolation { id: packet.id() });
            }
        }

        self.packets.push_back(packet);

        Ok(())
    }

    /// Places a packet according to its id. Returns `false`, leaving the buffer untouched, if a
    /// packet with the same id is already present.
    pub fn insert_by_id(&mut self, packet: Packet) -> bool {
        let id = packet.id();

        // Fast paths: in-order arrival and retransmission of the current extremes
        match (self.packets.front(), self.packets.back()) {
            (None, _) | (_, None) => {
                self.packets.push_back(packet);
                return true;
            }
            (Some(front), Some(back)) => {
                if front.id() == id || back.id() == id {
                    return false;
                }

                if back.id() < id {
                    self.packets.push_back(packet);
                    return true;
                }

                if front.id() > id {
                    self.packets.push_front(packet);
                    return true;
                }
            }
        }

        match self.packets.binary_search_by_key(&id, |p| p.id()) {
            Ok(_) => false,
            Err(index) => {
                self.packets.insert(index, packet);
                true
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Drops every packet.
    pub fn release(&mut self) {
        self.packets.clear();
    }

    /// Applies an acknowledgement for `id`.
    ///
    /// Every unacknowledged packet in front of `id`, except its immediate predecessor, is passed
    /// to `resend`. The acknowledged packet is then marked and the leading run of acknowledged
    /// packets is released. Returns `None` if `id` is below the front of the buffer (stale) or
    /// not present at all.
    pub fn acknowledge<F>(&mut self, id: u32, mut resend: F) -> Option<AckOutcome>
    where
        F: FnMut(&Packet),
    {
        match self.packets.front() {
            Some(front) if front.id() <= id => (),
            _ => return None,
        }

        let index = self.packets.iter().position(|p| p.id() == id)?;

        let mut outcome = AckOutcome::default();

        for packet in self.packets.iter().take(index.saturating_sub(1)) {
            if !packet.is_acked() {
                resend(packet);
                outcome.resent += 1;
            }
        }

        self.packets[index].set_acked();

        while let Some(front) = self.packets.front() {
            if !front.is_acked() {
                break;
            }

            self.packets.pop_front();
            outcome.released += 1;
        }

        Some(outcome)
    }

    /// Passes every unacknowledged packet to `resend`, returning how many there were.
    pub fn resend_unacked<F>(&self, mut resend: F) -> usize
    where
        F: FnMut(&Packet),
    {
        let mut count = 0;

        for packet in self.iter().filter(|p| !p.is_acked()) {
            resend(packet);
            count += 1;
        }

        count
    }
}
