//! Asynchronous notifications for the host, sent on the event channel.
//!
//! Each event starts with a five byte header: `type: u16, len: u16, version: u8`, followed by
//! `len` bytes of event data.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::packet::MacAddress;

pub const EVENT_HEADER_LEN: usize = 5;
/// Longest SSID, including the terminating zero.
pub const SSID_FIELD_LEN: usize = 33;
/// Size of the AT command text field.
pub const AT_STRING_LEN: usize = 200;
/// Longest payload of a user defined event.
pub const MAX_USER_EVENT_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventType {
    Network,
    Scan,
    AtCommand,
    User,
}
impl EventType {
    pub const fn into_bits(self) -> u16 {
        match self {
            Self::Network => 0,
            Self::Scan => 1,
            Self::AtCommand => 2,
            Self::User => 3,
        }
    }
    /// The version of the payload layout.
    pub const fn version(self) -> u8 {
        1
    }
}

fn event_with_header(event_type: EventType, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(EVENT_HEADER_LEN + len);
    out.extend_from_slice(&event_type.into_bits().to_le_bytes());
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.push(event_type.version());
    out
}

/// Copy at most `N - 1` bytes, so the field stays zero terminated.
fn terminated_field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut field = [0u8; N];
    let len = bytes.len().min(N - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// A change of the Wi-Fi connection state.
pub enum NetworkEvent {
    Connected,
    ConnectFailed,
    Reconnected,
    Disconnected { reason: u32 },
    IpChanged(Ipv4Addr),
}
impl NetworkEvent {
    const BODY_LEN: usize = 5;

    fn subtype(&self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::ConnectFailed => 1,
            Self::Reconnected => 2,
            Self::Disconnected { .. } => 3,
            Self::IpChanged(_) => 4,
        }
    }
    /// Whether the link is up after this event.
    pub fn link_up(&self) -> Option<bool> {
        match self {
            Self::Connected | Self::Reconnected => Some(true),
            Self::Disconnected { .. } => Some(false),
            _ => None,
        }
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut out = event_with_header(EventType::Network, Self::BODY_LEN);
        out.push(self.subtype());
        match self {
            Self::Disconnected { reason } => out.extend_from_slice(&reason.to_le_bytes()),
            // The address is kept in network byte order.
            Self::IpChanged(address) => out.extend_from_slice(&address.octets()),
            _ => out.extend_from_slice(&[0; 4]),
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// An access point found during a scan.
pub struct ScanResult {
    pub ssid: Vec<u8>,
    pub security: u32,
    pub bssid: MacAddress,
    pub signal_strength: i16,
    pub channel: u8,
    pub band: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    Result(ScanResult),
    Complete,
}
impl ScanEvent {
    const BODY_LEN: usize = 49;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = event_with_header(EventType::Scan, Self::BODY_LEN);
        match self {
            Self::Result(result) => {
                let ssid = terminated_field::<SSID_FIELD_LEN>(&result.ssid);
                out.push(result.ssid.len().min(SSID_FIELD_LEN - 1) as u8);
                out.extend_from_slice(&ssid);
                out.extend_from_slice(&result.security.to_le_bytes());
                out.extend_from_slice(&result.bssid);
                out.extend_from_slice(&result.signal_strength.to_le_bytes());
                out.push(result.channel);
                out.push(result.band);
                out.push(false as u8);
            }
            Self::Complete => {
                out.resize(out.len() + Self::BODY_LEN - 1, 0);
                out.push(true as u8);
            }
        }
        out
    }
}

/// The output of an AT command, for the host.
///
/// The text is truncated to the size of the field. The announced length is always the full field.
pub fn encode_at_event(text: &[u8]) -> Vec<u8> {
    let mut out = event_with_header(EventType::AtCommand, AT_STRING_LEN);
    let len = text.len().min(AT_STRING_LEN);
    out.extend_from_slice(&text[..len]);
    out.resize(EVENT_HEADER_LEN + AT_STRING_LEN, 0);
    out
}

/// A user defined event. Returns [None], if `data` is too long.
pub fn encode_user_event(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() > MAX_USER_EVENT_LEN {
        return None;
    }
    let mut out = event_with_header(EventType::User, data.len());
    out.extend_from_slice(data);
    Some(out)
}
