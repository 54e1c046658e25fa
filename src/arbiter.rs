//! Per frame traffic arbitration between the local network stack and the host.
//!
//! Flows originating from the local stack are tracked in a session table. Frames arriving from
//! the Wi-Fi link, that belong to one of these flows, or are addressed to a whitelisted port, are
//! delivered to the local stack. Everything else belongs to the host.

use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use embassy_time::{Duration, Instant, Ticker};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    arp::ArpTable,
    packet::{
        ArpOperation, ArpPacket, EtherType, EthernetFrame, IpProtocol, Ipv4Packet,
        ARP_PACKET_LEN, ETHERNET_HEADER_LEN,
    },
    session::{FlowKey, SessionTable, SessionTableFull},
    stats::{ArbiterStats, Counter},
    whitelist::{WhitelistError, WhitelistPorts},
    DefaultRawMutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Timing parameters of the [Arbiter].
pub struct ArbiterConfig {
    /// Sessions not seen for this long are evicted.
    pub session_timeout: Duration,
    /// ARP requests without a reply for this long are evicted.
    pub arp_timeout: Duration,
    /// The interval of the periodic sweep.
    pub sweep_interval: Duration,
    /// Run the periodic sweep while the link is up.
    ///
    /// If this is disabled, sessions are never evicted by time and the ARP table is swept, every
    /// time a reply doesn't match.
    pub periodic_sweep: bool,
}
impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(16),
            arp_timeout: Duration::from_secs(16),
            sweep_interval: Duration::from_secs(5),
            periodic_sweep: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutboundAction {
    /// Hand the frame to the Wi-Fi link.
    Forward,
    /// The frame is malformed.
    Drop,
}
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutboundDecision {
    pub action: OutboundAction,
    /// The length of the frame on the wire, which may be shorter than the buffer.
    pub length: usize,
}
impl OutboundDecision {
    const fn forward(length: usize) -> Self {
        Self {
            action: OutboundAction::Forward,
            length,
        }
    }
    const fn drop(length: usize) -> Self {
        Self {
            action: OutboundAction::Drop,
            length,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InboundDecision {
    /// Pass the frame to the local network stack.
    DeliverLocally,
    /// Queue the frame for the host.
    ForwardToBus,
}

/// The length of a frame on the wire, derived from it's headers.
///
/// For IPv4 this is based on the total length field and for ARP on the fixed packet size. Other
/// frames are taken as is. Returns [None], if the headers are malformed or claim more bytes than
/// there are.
pub fn wire_length(frame: &[u8]) -> Option<usize> {
    let ethernet = EthernetFrame::parse(frame).ok()?;
    let length = match ethernet.ether_type() {
        EtherType::Ipv4 => {
            let packet = Ipv4Packet::parse(ethernet.payload()).ok()?;
            ETHERNET_HEADER_LEN + packet.total_len() as usize
        }
        EtherType::Arp => ETHERNET_HEADER_LEN + ARP_PACKET_LEN,
        _ => frame.len(),
    };
    (length <= frame.len()).then_some(length)
}

/// The traffic arbiter.
///
/// The session table, the ARP table and the whitelist are each behind their own lock.
pub struct Arbiter<const SESSIONS: usize = 64, const ARP_SLOTS: usize = 16, const PORTS: usize = 16>
{
    sessions: blocking_mutex::Mutex<DefaultRawMutex, RefCell<SessionTable<SESSIONS>>>,
    arp: blocking_mutex::Mutex<DefaultRawMutex, RefCell<ArpTable<ARP_SLOTS>>>,
    whitelist: blocking_mutex::Mutex<DefaultRawMutex, RefCell<WhitelistPorts<PORTS>>>,
    config: ArbiterConfig,
    sweeping: AtomicBool,

    sessions_full: Counter,
    malformed: Counter,
    unsupported: Counter,
    evicted: Counter,
}
impl<const SESSIONS: usize, const ARP_SLOTS: usize, const PORTS: usize>
    Arbiter<SESSIONS, ARP_SLOTS, PORTS>
{
    pub const fn new(config: ArbiterConfig) -> Self {
        Self {
            sessions: blocking_mutex::Mutex::new(RefCell::new(SessionTable::new(
                config.session_timeout,
            ))),
            arp: blocking_mutex::Mutex::new(RefCell::new(ArpTable::new(
                config.arp_timeout,
                !config.periodic_sweep,
            ))),
            whitelist: blocking_mutex::Mutex::new(RefCell::new(WhitelistPorts::new())),
            config,
            sweeping: AtomicBool::new(false),
            sessions_full: Counter::new(),
            malformed: Counter::new(),
            unsupported: Counter::new(),
            evicted: Counter::new(),
        }
    }
    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }
    fn malformed(&self, length: usize) -> OutboundDecision {
        self.malformed.increment();
        OutboundDecision::drop(length)
    }
    /// Classify a frame, that the local stack wants to send.
    ///
    /// UDP, TCP and ICMP flows are added to the session table and outgoing ARP requests are
    /// remembered. Only malformed frames are dropped. A full session table doesn't stop the frame
    /// from being sent.
    pub fn classify_outbound(&self, frame: &[u8], now: Instant) -> OutboundDecision {
        let Ok(ethernet) = EthernetFrame::parse(frame) else {
            return self.malformed(frame.len());
        };
        match ethernet.ether_type() {
            EtherType::Ipv4 => {
                let Ok(packet) = Ipv4Packet::parse(ethernet.payload()) else {
                    return self.malformed(frame.len());
                };
                let length = ETHERNET_HEADER_LEN + packet.total_len() as usize;
                if length > frame.len() {
                    debug!(
                        "IPv4 total length {} exceeds frame of {} bytes.",
                        packet.total_len(),
                        frame.len()
                    );
                    return self.malformed(frame.len());
                }
                match packet.protocol() {
                    IpProtocol::Udp | IpProtocol::Tcp | IpProtocol::Icmp => {
                        let key = FlowKey::from_ipv4(&packet);
                        let result = self
                            .sessions
                            .lock(|sessions| sessions.borrow_mut().add(&key, now));
                        if let Err(SessionTableFull) = result {
                            self.sessions_full.increment();
                            warn!("Session table is full, flow to port {} not tracked.", key.destination_port);
                        }
                    }
                    IpProtocol::Unknown(protocol) => {
                        self.unsupported.increment();
                        trace!("Unsupported IPv4 protocol {}.", protocol);
                    }
                }
                OutboundDecision::forward(length)
            }
            EtherType::Arp => {
                let Ok(arp) = ArpPacket::parse(ethernet.payload()) else {
                    return self.malformed(frame.len());
                };
                if arp.operation == ArpOperation::Request {
                    self.arp
                        .lock(|table| table.borrow_mut().note_request(&arp, now));
                }
                OutboundDecision::forward(ETHERNET_HEADER_LEN + ARP_PACKET_LEN)
            }
            ether_type => {
                self.unsupported.increment();
                trace!("Unsupported ether type {:#x}.", ether_type.into_bits());
                OutboundDecision::forward(frame.len())
            }
        }
    }
    /// Classify a frame received from the Wi-Fi link.
    pub fn classify_inbound(&self, frame: &[u8], now: Instant) -> InboundDecision {
        let Ok(ethernet) = EthernetFrame::parse(frame) else {
            self.malformed.increment();
            return InboundDecision::ForwardToBus;
        };
        if ethernet.is_multicast() {
            return InboundDecision::DeliverLocally;
        }
        let matched = match ethernet.ether_type() {
            EtherType::Ipv4 => match Ipv4Packet::parse(ethernet.payload()) {
                Ok(packet) => {
                    let key = FlowKey::from_ipv4(&packet);
                    if key.destination_port != 0 && self.is_whitelisted(key.destination_port) {
                        trace!("Port {} is whitelisted.", key.destination_port);
                        true
                    } else {
                        self.sessions
                            .lock(|sessions| sessions.borrow_mut().query(&key.swapped(), true, now))
                    }
                }
                Err(_) => {
                    self.malformed.increment();
                    false
                }
            },
            EtherType::Arp => match ArpPacket::parse(ethernet.payload()) {
                Ok(arp) if arp.operation == ArpOperation::Reply => self
                    .arp
                    .lock(|table| table.borrow_mut().try_match(&arp, now)),
                Ok(_) => false,
                Err(_) => {
                    self.malformed.increment();
                    false
                }
            },
            _ => false,
        };
        if matched {
            InboundDecision::DeliverLocally
        } else {
            InboundDecision::ForwardToBus
        }
    }
    /// Evict stale sessions and ARP requests.
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted = self
            .sessions
            .lock(|sessions| sessions.borrow_mut().sweep(now))
            + self.arp.lock(|table| table.borrow_mut().sweep(now));
        self.evicted.add(evicted as u32);
        evicted
    }
    /// Start or stop the periodic sweep.
    ///
    /// This follows the state of the Wi-Fi link.
    pub fn set_sweeping(&self, active: bool) {
        let active = active && self.config.periodic_sweep;
        if self.sweeping.swap(active, Ordering::Relaxed) != active {
            debug!("Periodic sweep {}.", if active { "started" } else { "stopped" });
        }
    }
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Relaxed)
    }
    /// Periodically sweep the tables, while sweeping is active.
    pub async fn run_sweeper(&self) -> ! {
        let mut ticker = Ticker::every(self.config.sweep_interval);
        loop {
            ticker.next().await;
            if self.is_sweeping() {
                self.sweep(Instant::now());
            }
        }
    }
    /// Run `f` with exclusive access to the session table.
    pub fn with_sessions<R>(&self, f: impl FnOnce(&mut SessionTable<SESSIONS>) -> R) -> R {
        self.sessions.lock(|sessions| f(&mut sessions.borrow_mut()))
    }
    /// Run `f` with exclusive access to the ARP table.
    pub fn with_arp_table<R>(&self, f: impl FnOnce(&mut ArpTable<ARP_SLOTS>) -> R) -> R {
        self.arp.lock(|table| f(&mut table.borrow_mut()))
    }

    pub fn add_whitelist_port(&self, port: u16) -> Result<(), WhitelistError> {
        self.whitelist
            .lock(|whitelist| whitelist.borrow_mut().add(port))
    }
    /// Remove a port from the whitelist. Port zero clears it.
    pub fn remove_whitelist_port(&self, port: u16) -> Result<(), WhitelistError> {
        self.whitelist
            .lock(|whitelist| whitelist.borrow_mut().remove(port))
    }
    pub fn clear_whitelist(&self) {
        self.whitelist.lock(|whitelist| whitelist.borrow_mut().clear())
    }
    pub fn is_whitelisted(&self, port: u16) -> bool {
        self.whitelist.lock(|whitelist| whitelist.borrow().contains(port))
    }
    pub fn whitelist_len(&self) -> usize {
        self.whitelist.lock(|whitelist| whitelist.borrow().len())
    }
    pub fn whitelist_port(&self, index: usize) -> Option<u16> {
        self.whitelist.lock(|whitelist| whitelist.borrow().get(index))
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            sessions_full: self.sessions_full.get(),
            malformed: self.malformed.get(),
            unsupported: self.unsupported.get(),
            evicted: self.evicted.get(),
        }
    }
}
impl<const SESSIONS: usize, const ARP_SLOTS: usize, const PORTS: usize> Default
    for Arbiter<SESSIONS, ARP_SLOTS, PORTS>
{
    fn default() -> Self {
        Self::new(ArbiterConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::MacAddress;

    pub const LOCAL_MAC: MacAddress = [0x02, 0, 0, 0, 0, 0x01];
    pub const GATEWAY_MAC: MacAddress = [0x02, 0, 0, 0, 0, 0xfe];
    pub const LOCAL_IP: [u8; 4] = [192, 168, 1, 20];
    pub const REMOTE_IP: [u8; 4] = [10, 1, 2, 3];

    /// Build an Ethernet frame with an IPv4 header and a transport header of 8 bytes.
    pub fn ipv4_frame(
        destination_mac: MacAddress,
        source_ip: [u8; 4],
        destination_ip: [u8; 4],
        protocol: IpProtocol,
        source_port: u16,
        destination_port: u16,
    ) -> [u8; 42] {
        let mut frame = [0u8; 42];
        frame[0..6].copy_from_slice(&destination_mac);
        frame[6..12].copy_from_slice(&GATEWAY_MAC);
        frame[12..14].copy_from_slice(&EtherType::Ipv4.into_bits().to_be_bytes());
        let ip = &mut frame[14..];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&28u16.to_be_bytes());
        ip[8] = 64;
        ip[9] = protocol.into_bits();
        ip[12..16].copy_from_slice(&source_ip);
        ip[16..20].copy_from_slice(&destination_ip);
        ip[20..22].copy_from_slice(&source_port.to_be_bytes());
        ip[22..24].copy_from_slice(&destination_port.to_be_bytes());
        frame
    }
    pub fn arp_frame(arp: &ArpPacket) -> [u8; 42] {
        let mut frame = [0u8; 42];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&arp.sender_hardware_address);
        frame[12..14].copy_from_slice(&EtherType::Arp.into_bits().to_be_bytes());
        arp.write(&mut frame[14..]).unwrap();
        frame
    }

    fn outbound(protocol: IpProtocol, source_port: u16, destination_port: u16) -> [u8; 42] {
        ipv4_frame(
            GATEWAY_MAC,
            LOCAL_IP,
            REMOTE_IP,
            protocol,
            source_port,
            destination_port,
        )
    }
    fn inbound(protocol: IpProtocol, source_port: u16, destination_port: u16) -> [u8; 42] {
        ipv4_frame(
            LOCAL_MAC,
            REMOTE_IP,
            LOCAL_IP,
            protocol,
            source_port,
            destination_port,
        )
    }

    #[test]
    fn whitelisted_port_is_delivered_locally() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        arbiter.add_whitelist_port(5001).unwrap();
        let now = Instant::from_secs(0);
        assert_eq!(
            arbiter.classify_inbound(&inbound(IpProtocol::Udp, 40000, 5001), now),
            InboundDecision::DeliverLocally
        );
        assert_eq!(arbiter.with_sessions(|sessions| sessions.len()), 0);
    }

    #[test]
    fn reply_to_tracked_flow_is_delivered_locally() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        let decision = arbiter.classify_outbound(&outbound(IpProtocol::Tcp, 50123, 443), now);
        assert_eq!(decision, OutboundDecision::forward(42));
        assert_eq!(
            arbiter.classify_inbound(&inbound(IpProtocol::Tcp, 443, 50123), now),
            InboundDecision::DeliverLocally
        );
    }

    #[test]
    fn unknown_traffic_is_forwarded_to_bus() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        arbiter.classify_outbound(&outbound(IpProtocol::Tcp, 50123, 443), now);
        assert_eq!(
            arbiter.classify_inbound(&inbound(IpProtocol::Tcp, 443, 50124), now),
            InboundDecision::ForwardToBus
        );
        assert_eq!(
            arbiter.classify_inbound(&inbound(IpProtocol::Udp, 53, 60000), now),
            InboundDecision::ForwardToBus
        );
    }

    #[test]
    fn multicast_is_delivered_locally() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let frame = ipv4_frame(
            [0x01, 0x00, 0x5e, 0, 0, 0xfb],
            REMOTE_IP,
            [224, 0, 0, 251],
            IpProtocol::Udp,
            5353,
            5353,
        );
        assert_eq!(
            arbiter.classify_inbound(&frame, Instant::from_secs(0)),
            InboundDecision::DeliverLocally
        );
    }

    #[test]
    fn icmp_reply_consumes_session() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        arbiter.classify_outbound(&outbound(IpProtocol::Icmp, 0x0800, 0), now);
        let reply = inbound(IpProtocol::Icmp, 0, 0);
        assert_eq!(
            arbiter.classify_inbound(&reply, now),
            InboundDecision::DeliverLocally
        );
        assert_eq!(
            arbiter.classify_inbound(&reply, now),
            InboundDecision::ForwardToBus
        );
    }

    #[test]
    fn arp_reply_matches_outgoing_request() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        let request = ArpPacket {
            operation: ArpOperation::Request,
            sender_hardware_address: LOCAL_MAC,
            sender_protocol_address: LOCAL_IP,
            target_hardware_address: [0; 6],
            target_protocol_address: [192, 168, 1, 1],
        };
        let reply = ArpPacket {
            operation: ArpOperation::Reply,
            sender_hardware_address: GATEWAY_MAC,
            sender_protocol_address: [192, 168, 1, 1],
            target_hardware_address: LOCAL_MAC,
            target_protocol_address: LOCAL_IP,
        };
        let mut reply_frame = arp_frame(&reply);
        reply_frame[0..6].copy_from_slice(&LOCAL_MAC);
        assert_eq!(
            arbiter.classify_inbound(&reply_frame, now),
            InboundDecision::ForwardToBus
        );
        assert_eq!(
            arbiter.classify_outbound(&arp_frame(&request), now),
            OutboundDecision::forward(ETHERNET_HEADER_LEN + ARP_PACKET_LEN)
        );
        assert_eq!(arbiter.with_sessions(|sessions| sessions.len()), 0);
        assert_eq!(
            arbiter.classify_inbound(&reply_frame, now),
            InboundDecision::DeliverLocally
        );
        assert!(arbiter.with_arp_table(|table| table.is_empty()));
    }

    #[test]
    fn outbound_length_follows_ip_header() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        // Ethernet padding beyond the IP total length isn't part of the wire length.
        let mut padded = [0u8; 64];
        padded[..42].copy_from_slice(&outbound(IpProtocol::Udp, 1000, 2000));
        assert_eq!(
            arbiter.classify_outbound(&padded, now),
            OutboundDecision::forward(42)
        );
        assert_eq!(wire_length(&padded), Some(42));

        let mut truncated = outbound(IpProtocol::Udp, 1000, 2000);
        truncated[16..18].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(
            arbiter.classify_outbound(&truncated, now).action,
            OutboundAction::Drop
        );
        assert_eq!(wire_length(&truncated), None);
        assert_eq!(arbiter.stats().malformed, 1);
    }

    #[test]
    fn full_session_table_still_forwards() {
        let arbiter = Arbiter::<1, 4, 4>::default();
        let now = Instant::from_secs(0);
        arbiter.classify_outbound(&outbound(IpProtocol::Tcp, 1, 80), now);
        let decision = arbiter.classify_outbound(&outbound(IpProtocol::Tcp, 2, 80), now);
        assert_eq!(decision.action, OutboundAction::Forward);
        assert_eq!(arbiter.stats().sessions_full, 1);
    }

    #[test]
    fn fragments_are_tracked_without_ports() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        let now = Instant::from_secs(0);
        let mut fragment = outbound(IpProtocol::Udp, 1000, 2000);
        fragment[20..22].copy_from_slice(&0x2000u16.to_be_bytes());
        arbiter.classify_outbound(&fragment, now);
        let key = arbiter.with_sessions(|sessions| sessions.iter().next().map(|session| session.key));
        assert_eq!(key.map(|key| (key.source_port, key.destination_port)), Some((0, 0)));
    }

    #[test]
    fn sweep_follows_link_state() {
        let arbiter = Arbiter::<8, 4, 4>::default();
        assert!(!arbiter.is_sweeping());
        arbiter.set_sweeping(true);
        assert!(arbiter.is_sweeping());
        arbiter.classify_outbound(&outbound(IpProtocol::Tcp, 1, 80), Instant::from_secs(0));
        assert_eq!(arbiter.sweep(Instant::from_secs(17)), 1);
        assert_eq!(arbiter.stats().evicted, 1);

        let arbiter = Arbiter::<8, 4, 4>::new(ArbiterConfig {
            periodic_sweep: false,
            ..Default::default()
        });
        arbiter.set_sweeping(true);
        assert!(!arbiter.is_sweeping());
    }
}
