//! The header of control channel messages.
//!
//! All fields are little endian.

use alloc::vec::Vec;

use bitfield_struct::bitfield;

pub const BCDC_HEADER_LEN: usize = 16;
/// The only protocol version we accept.
pub const BCDC_PROTOCOL_VERSION: u8 = 2;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct BcdcFlags {
    __reserved0: bool,
    /// Set for set commands, clear for get commands.
    pub set: bool,
    #[bits(2)]
    __reserved1: u8,
    #[bits(4)]
    pub version: u8,
    __reserved2: u8,
    /// Pairs a response with it's request.
    pub request_id: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BcdcError {
    Truncated,
    VersionMismatch(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BcdcHeader {
    pub command: u32,
    /// Length of the message without this header.
    pub len: u32,
    pub flags: BcdcFlags,
    pub status: u32,
}
impl BcdcHeader {
    /// Parse and validate the header of a control message.
    pub fn parse(bytes: &[u8]) -> Result<Self, BcdcError> {
        if bytes.len() < BCDC_HEADER_LEN {
            return Err(BcdcError::Truncated);
        }
        let word = |index: usize| {
            let offset = index * 4;
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let header = Self {
            command: word(0),
            len: word(1),
            flags: BcdcFlags::from_bits(word(2)),
            status: word(3),
        };
        if header.flags.version() != BCDC_PROTOCOL_VERSION {
            return Err(BcdcError::VersionMismatch(header.flags.version()));
        }
        Ok(header)
    }
    /// The header of the response to this request, carrying `body_len` bytes.
    pub fn response(&self, body_len: usize, status: u32) -> Self {
        Self {
            command: self.command,
            len: body_len as u32,
            flags: BcdcFlags::new()
                .with_version(BCDC_PROTOCOL_VERSION)
                .with_request_id(self.flags.request_id()),
            status,
        }
    }
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.flags.into_bits().to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandId {
    MacAddress,
    Ipv4Address,
    GatewayAddress,
    Netmask,
    ApInfo,
    IpInfo,
    Scan,
    Connect,
    Disconnect,
    Ping,
    AtCommand,
    Unknown(u32),
}
impl CommandId {
    pub const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::MacAddress,
            2 => Self::Ipv4Address,
            3 => Self::GatewayAddress,
            4 => Self::Netmask,
            5 => Self::ApInfo,
            6 => Self::IpInfo,
            7 => Self::Scan,
            8 => Self::Connect,
            9 => Self::Disconnect,
            10 => Self::Ping,
            11 => Self::AtCommand,
            other => Self::Unknown(other),
        }
    }
    pub const fn into_bits(self) -> u32 {
        match self {
            Self::MacAddress => 1,
            Self::Ipv4Address => 2,
            Self::GatewayAddress => 3,
            Self::Netmask => 4,
            Self::ApInfo => 5,
            Self::IpInfo => 6,
            Self::Scan => 7,
            Self::Connect => 8,
            Self::Disconnect => 9,
            Self::Ping => 10,
            Self::AtCommand => 11,
            Self::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: u32, flags: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&command.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes
    }

    #[test]
    fn flags_layout() {
        let header = BcdcHeader::parse(&request(8, 0x002a_0022)).unwrap();
        assert!(header.flags.set());
        assert_eq!(header.flags.version(), 2);
        assert_eq!(header.flags.request_id(), 0x2a);
        assert_eq!(CommandId::from_bits(header.command), CommandId::Connect);
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let header = BcdcHeader::parse(&request(1, 0x0007_ff2d)).unwrap();
        assert!(!header.flags.set());
        assert_eq!(header.flags.version(), 2);
        assert_eq!(header.flags.request_id(), 7);
        let mut out = Vec::new();
        header.response(0, 0).write(&mut out);
        assert_eq!(&out[8..12], &0x0007_0020u32.to_le_bytes());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        assert_eq!(
            BcdcHeader::parse(&request(1, 0x0000_0010)),
            Err(BcdcError::VersionMismatch(1))
        );
        assert_eq!(
            BcdcHeader::parse(&request(1, 0x20)[..15]),
            Err(BcdcError::Truncated)
        );
    }

    #[test]
    fn response_header() {
        let header = BcdcHeader::parse(&request(5, 0x1234_0022)).unwrap();
        let mut out = Vec::new();
        header.response(49, 7).write(&mut out);
        assert_eq!(&out[0..4], &5u32.to_le_bytes());
        assert_eq!(&out[4..8], &49u32.to_le_bytes());
        // The set bit isn't mirrored.
        assert_eq!(&out[8..12], &0x1234_0020u32.to_le_bytes());
        assert_eq!(&out[12..16], &7u32.to_le_bytes());
    }
}
