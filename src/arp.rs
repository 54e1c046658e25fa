use embassy_time::{Duration, Instant};

use crate::packet::{ArpOperation, ArpPacket, MacAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An outstanding ARP request.
pub struct ArpEntry {
    pub sender_hardware_address: MacAddress,
    pub sender_protocol_address: [u8; 4],
    pub target_hardware_address: MacAddress,
    pub target_protocol_address: [u8; 4],
    pub noted_at: Instant,
}
impl ArpEntry {
    fn matches_request(&self, request: &ArpPacket) -> bool {
        self.sender_hardware_address == request.sender_hardware_address
            && self.sender_protocol_address == request.sender_protocol_address
            && self.target_hardware_address == request.target_hardware_address
            && self.target_protocol_address == request.target_protocol_address
    }
    /// The reply comes from the requested address and goes back to the requester.
    fn matches_reply(&self, reply: &ArpPacket) -> bool {
        self.target_protocol_address == reply.sender_protocol_address
            && self.sender_protocol_address == reply.target_protocol_address
            && self.sender_hardware_address == reply.target_hardware_address
    }
}

/// Correlates ARP requests with their replies.
pub struct ArpTable<const SLOTS: usize = 16> {
    slots: [Option<ArpEntry>; SLOTS],
    timeout: Duration,
    sweep_on_miss: bool,
}
impl<const SLOTS: usize> ArpTable<SLOTS> {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(16);

    /// Create a new table.
    ///
    /// If `sweep_on_miss` is set, a reply without a matching request sweeps the table. This is
    /// meant for setups without a periodic sweep.
    pub const fn new(timeout: Duration, sweep_on_miss: bool) -> Self {
        Self {
            slots: [const { None }; SLOTS],
            timeout,
            sweep_on_miss,
        }
    }
    /// The amount of outstanding requests.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn iter(&self) -> impl Iterator<Item = &ArpEntry> + '_ {
        self.slots.iter().flatten()
    }
    fn find_request(&self, request: &ArpPacket) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(entry) if entry.matches_request(request)))
    }
    /// Remember an outgoing ARP request.
    ///
    /// Requests, that are already tracked, are ignored. If no slot is free, the request isn't
    /// tracked.
    pub fn note_request(&mut self, request: &ArpPacket, now: Instant) {
        if self.find_request(request).is_some() {
            return;
        }
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            warn!("ARP table is full, request not tracked.");
            return;
        };
        *slot = Some(ArpEntry {
            sender_hardware_address: request.sender_hardware_address,
            sender_protocol_address: request.sender_protocol_address,
            target_hardware_address: request.target_hardware_address,
            target_protocol_address: request.target_protocol_address,
            noted_at: now,
        });
    }
    /// Check an ARP packet against the outstanding requests.
    ///
    /// A request matches, if it is already tracked. A reply matches, if it answers a tracked
    /// request, which is then released.
    pub fn try_match(&mut self, packet: &ArpPacket, now: Instant) -> bool {
        match packet.operation {
            ArpOperation::Request => self.find_request(packet).is_some(),
            ArpOperation::Reply => {
                let position = self
                    .slots
                    .iter()
                    .position(|slot| matches!(slot, Some(entry) if entry.matches_reply(packet)));
                match position {
                    Some(index) => {
                        self.slots[index] = None;
                        true
                    }
                    None => {
                        if self.sweep_on_miss {
                            self.sweep(now);
                        }
                        false
                    }
                }
            }
            ArpOperation::Unknown(_) => false,
        }
    }
    /// Release all requests older than the timeout.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut evicted = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(entry) if now.saturating_duration_since(entry.noted_at) > timeout)
            {
                *slot = None;
                evicted += 1;
            }
        }
        evicted
    }
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
impl<const SLOTS: usize> Default for ArpTable<SLOTS> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT, false)
    }
}
