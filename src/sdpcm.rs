//! The software framing protocol, that multiplexes logical channels over the bus.
//!
//! Every frame starts with an eight byte software header:
//!
//! | Offset | Field |
//! |---|---|
//! | 0 | Sequence number |
//! | 1 | Channel (low nibble) and flags (high nibble) |
//! | 2 | Length of the next frame, reserved for TX |
//! | 3 | Data offset, relative to the end of the header |
//! | 4 | Wireless flow control, reserved for TX |
//! | 5 | Bus data credit, the amount of free receive buffers |
//! | 6..8 | Reserved |

use bitfield_struct::bitfield;

pub const SW_HEADER_LEN: usize = 8;
/// The largest frame, that can be exchanged with the host.
pub const MAX_FRAME_LEN: usize = 1600;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - SW_HEADER_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A logical channel.
pub enum Channel {
    Control,
    Event,
    Data,
    /// Coalesced frames.
    Glom,
    AtCommand,
    Log,
    WriteTest,
    Loopback,
    TestCommand,
    Unknown(u8),
}
impl Channel {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Control,
            1 => Self::Event,
            2 => Self::Data,
            3 => Self::Glom,
            4 => Self::AtCommand,
            12 => Self::Log,
            13 => Self::WriteTest,
            14 => Self::Loopback,
            15 => Self::TestCommand,
            other => Self::Unknown(other),
        }
    }
    pub const fn into_bits(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Event => 1,
            Self::Data => 2,
            Self::Glom => 3,
            Self::AtCommand => 4,
            Self::Log => 12,
            Self::WriteTest => 13,
            Self::Loopback => 14,
            Self::TestCommand => 15,
            Self::Unknown(other) => other,
        }
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ChannelAndFlags {
    #[bits(4)]
    pub channel: u8,
    #[bits(4)]
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// The frame is shorter than the software header.
    Truncated,
    /// The payload doesn't fit into a frame.
    PayloadTooLarge,
    /// The output buffer is too small.
    BufferTooSmall,
    /// The data offset points past the end of the frame.
    InvalidDataOffset,
}
pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwHeader {
    pub sequence: u8,
    pub channel_and_flags: ChannelAndFlags,
    pub next_length: u8,
    pub data_offset: u8,
    pub flow_control: u8,
    pub bus_data_credit: u8,
}
impl SwHeader {
    pub fn parse(bytes: &[u8]) -> FrameResult<Self> {
        let bytes: &[u8; SW_HEADER_LEN] = bytes
            .get(..SW_HEADER_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(FrameError::Truncated)?;
        Ok(Self {
            sequence: bytes[0],
            channel_and_flags: ChannelAndFlags::from_bits(bytes[1]),
            next_length: bytes[2],
            data_offset: bytes[3],
            flow_control: bytes[4],
            bus_data_credit: bytes[5],
        })
    }
    pub fn write(&self, out: &mut [u8; SW_HEADER_LEN]) {
        *out = [
            self.sequence,
            self.channel_and_flags.into_bits(),
            self.next_length,
            self.data_offset,
            self.flow_control,
            self.bus_data_credit,
            0,
            0,
        ];
    }
    pub fn channel(&self) -> Channel {
        Channel::from_bits(self.channel_and_flags.channel())
    }
}

#[derive(Clone, Copy, Debug)]
/// A frame received from the host.
pub struct RxFrame<'a> {
    pub header: SwHeader,
    /// Everything after the software header.
    pub payload: &'a [u8],
    /// The amount of frames missing before this one.
    pub missed: u8,
}
impl<'a> RxFrame<'a> {
    pub fn sequence(&self) -> u8 {
        self.header.sequence
    }
    pub fn channel(&self) -> Channel {
        self.header.channel()
    }
    /// The payload, starting at the data offset.
    ///
    /// The offset is only used on the data channel.
    pub fn data(&self) -> FrameResult<&'a [u8]> {
        self.payload
            .get(self.header.data_offset as usize..)
            .ok_or(FrameError::InvalidDataOffset)
    }
}

/// Keeps track of the sequence numbers in both directions.
pub struct Framer {
    expected_sequence: u8,
    next_sequence: u8,
}
impl Framer {
    pub const fn new() -> Self {
        Self {
            expected_sequence: 0,
            next_sequence: 0,
        }
    }
    /// The sequence number, we expect the host to send next.
    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }
    /// The sequence number of the next frame we build.
    pub fn next_sequence(&self) -> u8 {
        self.next_sequence
    }
    /// Parse a frame from the host.
    ///
    /// A gap in the sequence numbers is logged, after which we resynchronize to the received
    /// sequence number. The frame is still returned.
    pub fn parse<'a>(&mut self, frame: &'a [u8]) -> FrameResult<RxFrame<'a>> {
        let header = SwHeader::parse(frame)?;
        let missed = header.sequence.wrapping_sub(self.expected_sequence);
        if missed != 0 {
            error!(
                "Received sequence {} doesn't match expected sequence {}.",
                header.sequence, self.expected_sequence
            );
        }
        self.expected_sequence = header.sequence.wrapping_add(1);
        Ok(RxFrame {
            header,
            payload: &frame[SW_HEADER_LEN..],
            missed,
        })
    }
    /// Build a frame for the host into `out`.
    ///
    /// Returns the length of the frame. The sequence number is only consumed, if the frame was
    /// built successfully.
    pub fn build(
        &mut self,
        channel: Channel,
        payload: &[u8],
        bus_data_credit: u8,
        out: &mut [u8],
    ) -> FrameResult<usize> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge);
        }
        let frame_len = SW_HEADER_LEN + payload.len();
        let out = out
            .get_mut(..frame_len)
            .ok_or(FrameError::BufferTooSmall)?;
        let (header, body) = out.split_at_mut(SW_HEADER_LEN);
        SwHeader {
            sequence: self.next_sequence,
            channel_and_flags: ChannelAndFlags::new().with_channel(channel.into_bits() & 0x0f),
            next_length: 0,
            data_offset: 0,
            flow_control: 0,
            bus_data_credit,
        }
        .write(header.try_into().map_err(|_| FrameError::BufferTooSmall)?);
        body.copy_from_slice(payload);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(frame_len)
    }
}
impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u8, channel: Channel, data_offset: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![sequence, channel.into_bits() | 0x30, 0, data_offset, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn sequence_gap_is_tolerated() {
        let mut framer = Framer::new();
        for sequence in 0..=5 {
            framer
                .parse(&frame(sequence, Channel::Control, 0, &[1]))
                .unwrap();
        }
        assert_eq!(framer.expected_sequence(), 6);
        let gap = frame(9, Channel::Control, 0, &[1]);
        let parsed = framer.parse(&gap).unwrap();
        assert_eq!(parsed.missed, 3);
        assert_eq!(parsed.payload, &[1]);
        assert_eq!(framer.expected_sequence(), 10);
    }

    #[test]
    fn sequence_wraps() {
        let mut framer = Framer::new();
        let first = frame(255, Channel::Event, 0, &[]);
        framer.parse(&first).unwrap();
        assert_eq!(framer.expected_sequence(), 0);
        let second = frame(0, Channel::Event, 0, &[]);
        assert_eq!(framer.parse(&second).unwrap().missed, 0);
    }

    #[test]
    fn channel_ignores_flags() {
        let mut framer = Framer::new();
        let raw = frame(0, Channel::Loopback, 0, &[]);
        let parsed = framer.parse(&raw).unwrap();
        assert_eq!(parsed.channel(), Channel::Loopback);
        assert_eq!(parsed.header.channel_and_flags.flags(), 3);
    }

    #[test]
    fn data_offset() {
        let mut framer = Framer::new();
        let raw = frame(0, Channel::Data, 2, &[0xaa, 0xbb, 1, 2, 3]);
        let parsed = framer.parse(&raw).unwrap();
        assert_eq!(parsed.data(), Ok(&[1u8, 2, 3][..]));
        let raw = frame(1, Channel::Data, 6, &[1, 2, 3]);
        assert_eq!(
            framer.parse(&raw).unwrap().data(),
            Err(FrameError::InvalidDataOffset)
        );
        assert_eq!(
            framer.parse(&[0u8; 7]).unwrap_err(),
            FrameError::Truncated
        );
    }

    #[test]
    fn build_stamps_header() {
        let mut framer = Framer::new();
        let mut out = [0xffu8; 32];
        let len = framer
            .build(Channel::Event, &[1, 2, 3], 7, &mut out)
            .unwrap();
        assert_eq!(len, 11);
        assert_eq!(&out[..11], &[0, 1, 0, 0, 0, 7, 0, 0, 1, 2, 3]);
        framer.build(Channel::Data, &[], 0, &mut out).unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 2);
        assert_eq!(framer.next_sequence(), 2);
    }

    #[test]
    fn build_rejects_oversized() {
        let mut framer = Framer::new();
        let payload = [0u8; MAX_PAYLOAD_LEN + 1];
        let mut out = [0u8; MAX_FRAME_LEN + 8];
        assert_eq!(
            framer.build(Channel::Data, &payload, 0, &mut out),
            Err(FrameError::PayloadTooLarge)
        );
        assert_eq!(
            framer.build(Channel::Data, &payload[..16], 0, &mut out[..20]),
            Err(FrameError::BufferTooSmall)
        );
        assert_eq!(framer.next_sequence(), 0);
    }
}
