//! Length checked views over Ethernet, IPv4 and ARP headers.
//!
//! All multi byte fields are in network byte order on the wire.

use core::net::Ipv4Addr;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_MIN_LEN: usize = 20;
pub const ARP_PACKET_LEN: usize = 28;

pub type MacAddress = [u8; 6];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A frame was too short or had an invalid header.
pub enum PacketError {
    Truncated,
    InvalidIpVersion,
    InvalidHeaderLength,
}
pub type PacketResult<T> = Result<T, PacketError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EtherType {
    Ipv4,
    Arp,
    Ipv6,
    Unknown(u16),
}
impl EtherType {
    pub const fn from_bits(bits: u16) -> Self {
        match bits {
            0x0800 => Self::Ipv4,
            0x0806 => Self::Arp,
            0x86dd => Self::Ipv6,
            other => Self::Unknown(other),
        }
    }
    pub const fn into_bits(self) -> u16 {
        match self {
            Self::Ipv4 => 0x0800,
            Self::Arp => 0x0806,
            Self::Ipv6 => 0x86dd,
            Self::Unknown(other) => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Unknown(u8),
}
impl IpProtocol {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Unknown(other),
        }
    }
    pub const fn into_bits(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Unknown(other) => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArpOperation {
    Request,
    Reply,
    Unknown(u16),
}
impl ArpOperation {
    pub const fn from_bits(bits: u16) -> Self {
        match bits {
            1 => Self::Request,
            2 => Self::Reply,
            other => Self::Unknown(other),
        }
    }
    pub const fn into_bits(self) -> u16 {
        match self {
            Self::Request => 1,
            Self::Reply => 2,
            Self::Unknown(other) => other,
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}
fn read_ipv4(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    )
}
fn read_mac(bytes: &[u8], offset: usize) -> MacAddress {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    mac
}

#[derive(Clone, Copy, Debug)]
/// An Ethernet II frame.
pub struct EthernetFrame<'a> {
    bytes: &'a [u8],
}
impl<'a> EthernetFrame<'a> {
    pub fn parse(bytes: &'a [u8]) -> PacketResult<Self> {
        if bytes.len() < ETHERNET_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        Ok(Self { bytes })
    }
    pub fn destination(&self) -> MacAddress {
        read_mac(self.bytes, 0)
    }
    pub fn source(&self) -> MacAddress {
        read_mac(self.bytes, 6)
    }
    pub fn ether_type(&self) -> EtherType {
        EtherType::from_bits(read_u16(self.bytes, 12))
    }
    /// Group addresses have the I/G bit set, which includes broadcast.
    pub fn is_multicast(&self) -> bool {
        self.bytes[0] & 0x01 != 0
    }
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[ETHERNET_HEADER_LEN..]
    }
    /// The length of the frame as it was passed in.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Clone, Copy, Debug)]
/// An IPv4 header, followed by it's payload.
pub struct Ipv4Packet<'a> {
    bytes: &'a [u8],
}
impl<'a> Ipv4Packet<'a> {
    const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
    const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

    pub fn parse(bytes: &'a [u8]) -> PacketResult<Self> {
        if bytes.len() < IPV4_HEADER_MIN_LEN {
            return Err(PacketError::Truncated);
        }
        if bytes[0] >> 4 != 4 {
            return Err(PacketError::InvalidIpVersion);
        }
        let packet = Self { bytes };
        let header_len = packet.header_len();
        if header_len < IPV4_HEADER_MIN_LEN || (packet.total_len() as usize) < header_len {
            return Err(PacketError::InvalidHeaderLength);
        }
        if bytes.len() < header_len {
            return Err(PacketError::Truncated);
        }
        Ok(packet)
    }
    /// The header length in bytes, including options.
    pub fn header_len(&self) -> usize {
        ((self.bytes[0] & 0x0f) as usize) * 4
    }
    pub fn total_len(&self) -> u16 {
        read_u16(self.bytes, 2)
    }
    pub fn more_fragments(&self) -> bool {
        read_u16(self.bytes, 6) & Self::FLAG_MORE_FRAGMENTS != 0
    }
    pub fn fragment_offset(&self) -> u16 {
        read_u16(self.bytes, 6) & Self::FRAGMENT_OFFSET_MASK
    }
    /// Returns true, if the transport header isn't fully contained in this packet.
    pub fn is_fragmented(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from_bits(self.bytes[9])
    }
    pub fn source(&self) -> Ipv4Addr {
        read_ipv4(self.bytes, 12)
    }
    pub fn destination(&self) -> Ipv4Addr {
        read_ipv4(self.bytes, 16)
    }
    /// The transport payload, bounded by both the total length and the available bytes.
    pub fn payload(&self) -> &'a [u8] {
        let end = (self.total_len() as usize).min(self.bytes.len());
        &self.bytes[self.header_len()..end]
    }
    /// Source and destination port of a UDP or TCP packet.
    ///
    /// Returns [None], if the payload is too short to contain them.
    pub fn transport_ports(&self) -> Option<(u16, u16)> {
        let payload = self.payload();
        if payload.len() < 4 {
            return None;
        }
        Some((read_u16(payload, 0), read_u16(payload, 2)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An Ethernet/IPv4 ARP packet.
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_hardware_address: MacAddress,
    pub sender_protocol_address: [u8; 4],
    pub target_hardware_address: MacAddress,
    pub target_protocol_address: [u8; 4],
}
impl ArpPacket {
    pub fn parse(bytes: &[u8]) -> PacketResult<Self> {
        if bytes.len() < ARP_PACKET_LEN {
            return Err(PacketError::Truncated);
        }
        let mut sender_protocol_address = [0u8; 4];
        sender_protocol_address.copy_from_slice(&bytes[14..18]);
        let mut target_protocol_address = [0u8; 4];
        target_protocol_address.copy_from_slice(&bytes[24..28]);
        Ok(Self {
            operation: ArpOperation::from_bits(read_u16(bytes, 6)),
            sender_hardware_address: read_mac(bytes, 8),
            sender_protocol_address,
            target_hardware_address: read_mac(bytes, 18),
            target_protocol_address,
        })
    }
    /// Serialize the packet for Ethernet and IPv4.
    pub fn write(&self, out: &mut [u8]) -> PacketResult<usize> {
        let out = out
            .get_mut(..ARP_PACKET_LEN)
            .ok_or(PacketError::Truncated)?;
        out[0..2].copy_from_slice(&1u16.to_be_bytes());
        out[2..4].copy_from_slice(&EtherType::Ipv4.into_bits().to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&self.operation.into_bits().to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_hardware_address);
        out[14..18].copy_from_slice(&self.sender_protocol_address);
        out[18..24].copy_from_slice(&self.target_hardware_address);
        out[24..28].copy_from_slice(&self.target_protocol_address);
        Ok(ARP_PACKET_LEN)
    }
}
