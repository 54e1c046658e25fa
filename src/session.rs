use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};

use crate::packet::{IpProtocol, Ipv4Packet};

/// Discriminator used instead of ports for ICMP flows.
pub const ICMP_FLOW_MARKER: u16 = 0x99;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// The tuple identifying a bridged IP flow.
pub struct FlowKey {
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    /// Non-zero for ICMP flows, which are single shot.
    pub icmp_marker: u16,
    /// The protocol byte of the IPv4 header.
    pub protocol: u8,
}
impl FlowKey {
    /// Extract the flow key from an IPv4 packet, as seen by the sender.
    ///
    /// Ports are only read for the first fragment of UDP and TCP packets. Packets of other
    /// protocols get zero ports.
    pub fn from_ipv4(packet: &Ipv4Packet<'_>) -> Self {
        let protocol = packet.protocol();
        let (source_port, destination_port, icmp_marker) = match protocol {
            IpProtocol::Udp | IpProtocol::Tcp if !packet.is_fragmented() => {
                let (source_port, destination_port) = packet.transport_ports().unwrap_or((0, 0));
                (source_port, destination_port, 0)
            }
            IpProtocol::Icmp => (0, 0, ICMP_FLOW_MARKER),
            _ => (0, 0, 0),
        };
        Self {
            local: packet.source(),
            remote: packet.destination(),
            source_port,
            destination_port,
            icmp_marker,
            protocol: protocol.into_bits(),
        }
    }
    /// The same flow, as seen by the other end.
    pub fn swapped(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
            source_port: self.destination_port,
            destination_port: self.source_port,
            ..*self
        }
    }
    /// The hash key used for matching sessions.
    ///
    /// This isn't symmetric, so a reply has to be looked up with [FlowKey::swapped].
    pub fn hash_key(&self) -> u32 {
        u32::from(self.local)
            ^ 123u32.wrapping_mul(self.source_port as u32)
            ^ u32::from(self.remote)
            ^ 456u32.wrapping_mul(self.destination_port as u32)
            ^ 123_456u32.wrapping_mul(self.protocol as u32)
            ^ 78u32.wrapping_mul(self.icmp_marker as u32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// One tracked flow.
pub struct Session {
    pub key: FlowKey,
    hash_key: u32,
    last_seen: Instant,
}
impl Session {
    pub fn hash_key(&self) -> u32 {
        self.hash_key
    }
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The maximum amount of sessions is already tracked.
pub struct SessionTableFull;

/// A fixed capacity table of IP sessions.
///
/// Sessions live in a slab of `SESSIONS` slots. Matching is done by hash key only and is a linear
/// scan, so the first slot with an equal key wins.
pub struct SessionTable<const SESSIONS: usize = 64> {
    slots: [Option<Session>; SESSIONS],
    len: usize,
    timeout: Duration,
}
impl<const SESSIONS: usize> SessionTable<SESSIONS> {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(16);

    pub const fn new(timeout: Duration) -> Self {
        Self {
            slots: [const { None }; SESSIONS],
            len: 0,
            timeout,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub const fn capacity(&self) -> usize {
        SESSIONS
    }
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    pub fn iter(&self) -> impl Iterator<Item = &Session> + '_ {
        self.slots.iter().flatten()
    }
    fn position(&self, hash_key: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(session) if session.hash_key == hash_key))
    }
    /// Track a new flow.
    ///
    /// Returns `Ok(true)`, if a new session was inserted, and `Ok(false)`, if the flow was already
    /// tracked, in which case it was refreshed.
    ///
    /// NOTE: This goes through [SessionTable::query], so adding an ICMP flow, that is already
    /// tracked, removes it instead.
    pub fn add(&mut self, key: &FlowKey, now: Instant) -> Result<bool, SessionTableFull> {
        if self.query(key, true, now) {
            return Ok(false);
        }
        if self.len >= SESSIONS {
            return Err(SessionTableFull);
        }
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return Err(SessionTableFull);
        };
        *slot = Some(Session {
            key: *key,
            hash_key: key.hash_key(),
            last_seen: now,
        });
        self.len += 1;
        trace!(
            "Added session {}:{} -> {}:{} proto {}.",
            u32::from(key.local),
            key.source_port,
            u32::from(key.remote),
            key.destination_port,
            key.protocol
        );
        Ok(true)
    }
    /// Look up a flow.
    ///
    /// If `refresh` is set, the last seen time of a match is updated. A match with a non-zero ICMP
    /// marker is deleted, even if this is only a query.
    pub fn query(&mut self, key: &FlowKey, refresh: bool, now: Instant) -> bool {
        let Some(index) = self.position(key.hash_key()) else {
            return false;
        };
        if key.icmp_marker != 0 {
            self.slots[index] = None;
            self.len -= 1;
            trace!("Removed single shot ICMP session.");
        } else if refresh {
            if let Some(session) = self.slots[index].as_mut() {
                session.last_seen = now;
            }
        }
        true
    }
    /// Remove the session matching this key, if there is one.
    pub fn delete(&mut self, key: &FlowKey) {
        if let Some(index) = self.position(key.hash_key()) {
            self.slots[index] = None;
            self.len -= 1;
        }
    }
    /// Remove all sessions, that haven't been seen for longer than the timeout.
    ///
    /// Returns the amount of evicted sessions.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut evicted = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(session) if now.saturating_duration_since(session.last_seen) > timeout)
            {
                *slot = None;
                evicted += 1;
            }
        }
        self.len -= evicted;
        if evicted != 0 {
            debug!("Swept {} stale sessions, {} remaining.", evicted, self.len);
        }
        evicted
    }
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.len = 0;
    }
}
impl<const SESSIONS: usize> Default for SessionTable<SESSIONS> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_key(source_port: u16, destination_port: u16) -> FlowKey {
        FlowKey {
            local: Ipv4Addr::new(192, 168, 0, 10),
            remote: Ipv4Addr::new(93, 184, 216, 34),
            source_port,
            destination_port,
            icmp_marker: 0,
            protocol: IpProtocol::Tcp.into_bits(),
        }
    }
    fn icmp_key() -> FlowKey {
        FlowKey {
            source_port: 0,
            destination_port: 0,
            icmp_marker: ICMP_FLOW_MARKER,
            protocol: IpProtocol::Icmp.into_bits(),
            ..tcp_key(0, 0)
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = SessionTable::<8>::default();
        let key = tcp_key(50000, 443);
        assert_eq!(table.add(&key, Instant::from_secs(1)), Ok(true));
        assert_eq!(table.add(&key, Instant::from_secs(2)), Ok(false));
        assert_eq!(table.len(), 1);
        // The second add refreshed the session.
        assert_eq!(
            table.iter().next().map(Session::last_seen),
            Some(Instant::from_secs(2))
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = SessionTable::<2>::default();
        let now = Instant::from_secs(0);
        assert_eq!(table.add(&tcp_key(1, 80), now), Ok(true));
        assert_eq!(table.add(&tcp_key(2, 80), now), Ok(true));
        assert_eq!(table.add(&tcp_key(3, 80), now), Err(SessionTableFull));
        // Existing flows are still refreshed.
        assert_eq!(table.add(&tcp_key(1, 80), now), Ok(false));
        table.delete(&tcp_key(1, 80));
        assert_eq!(table.add(&tcp_key(3, 80), now), Ok(true));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn icmp_sessions_are_single_shot() {
        let mut table = SessionTable::<8>::default();
        let now = Instant::from_secs(0);
        assert_eq!(table.add(&icmp_key(), now), Ok(true));
        assert!(table.query(&icmp_key(), false, now));
        assert!(!table.query(&icmp_key(), false, now));
        assert!(table.is_empty());
    }

    #[test]
    fn icmp_add_of_tracked_flow_removes_it() {
        // Adding goes through the query path, so a repeated ICMP add deletes the session instead
        // of refreshing it.
        let mut table = SessionTable::<8>::default();
        let now = Instant::from_secs(0);
        assert_eq!(table.add(&icmp_key(), now), Ok(true));
        assert_eq!(table.add(&icmp_key(), now), Ok(false));
        assert!(table.is_empty());
    }

    #[test]
    fn query_without_refresh_keeps_timestamp() {
        let mut table = SessionTable::<8>::default();
        let key = tcp_key(4000, 22);
        table.add(&key, Instant::from_secs(1)).unwrap();
        assert!(table.query(&key, false, Instant::from_secs(5)));
        assert_eq!(
            table.iter().next().map(Session::last_seen),
            Some(Instant::from_secs(1))
        );
        assert!(!table.query(&key.swapped(), true, Instant::from_secs(5)));
    }

    #[test]
    fn sweep_uses_timeout() {
        let mut table = SessionTable::<8>::new(Duration::from_secs(16));
        let t0 = Instant::from_secs(100);
        table.add(&tcp_key(1, 80), t0).unwrap();
        assert_eq!(table.sweep(Instant::from_secs(100 + 16 - 1)), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.sweep(Instant::from_secs(100 + 16 + 1)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn hash_key_is_not_symmetric() {
        let key = tcp_key(50000, 443);
        assert_ne!(key.hash_key(), key.swapped().hash_key());
        assert_eq!(key.swapped().swapped(), key);
    }
}
