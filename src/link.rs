use crate::{
    bus::{BufferPool, BusResult, HostBus, MAILBOX_FRAME_READY},
    sdpcm::{Channel, FrameError, Framer, RxFrame, MAX_FRAME_LEN},
    tx_queue::{FrameSink, SendError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Receiving a frame from the host failed.
pub enum RxError {
    /// The hardware header announced an empty frame.
    ZeroLength,
    /// The announced frame doesn't fit into the receive buffer.
    Oversized(u16),
    /// Reading the payload failed.
    ReadFailed,
    /// Arming the hardware for the next header failed.
    HeaderFailed,
    /// The frame was read, but couldn't be parsed.
    Malformed(FrameError),
}

/// The state of the bus link.
///
/// This is owned by the worker loop, which is the only context that drives the bus. The sequence
/// numbers and the reserved receive buffer are therefore never shared.
pub struct HostLink<Bus, B> {
    bus: Bus,
    framer: Framer,
    reserved: Option<B>,
    tx_buffer: [u8; MAX_FRAME_LEN],
    mailbox_data: u32,
    rx_armed: bool,
}
impl<Bus: HostBus, B> HostLink<Bus, B> {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            framer: Framer::new(),
            reserved: None,
            tx_buffer: [0; MAX_FRAME_LEN],
            mailbox_data: 0,
            rx_armed: false,
        }
    }
    pub fn bus(&self) -> &Bus {
        &self.bus
    }
    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }
    pub fn framer(&self) -> &Framer {
        &self.framer
    }
    /// The value, that will be written to the mailbox data register next.
    pub fn mailbox_data(&self) -> u32 {
        self.mailbox_data
    }

    pub fn has_reserved_buffer(&self) -> bool {
        self.reserved.is_some()
    }
    /// Reserve a receive buffer, if we don't hold one yet.
    ///
    /// Returns true, if a new buffer was reserved.
    pub fn reserve_buffer<P: BufferPool<Buffer = B>>(&mut self, pool: &P) -> bool {
        if self.reserved.is_some() {
            return false;
        }
        self.reserved = pool.allocate();
        if self.reserved.is_none() {
            trace!("No free buffer to reserve for RX.");
        }
        self.reserved.is_some()
    }
    pub fn take_reserved_buffer(&mut self) -> Option<B> {
        self.reserved.take()
    }
    pub fn release_reserved_buffer<P: BufferPool<Buffer = B>>(&mut self, pool: &P) {
        if let Some(buffer) = self.reserved.take() {
            pool.release(buffer);
        }
    }

    /// Tell the host, that we're ready for the next frame.
    ///
    /// The mailbox data value only advances, if the write succeeded.
    pub fn notify_host(&mut self) -> BusResult<()> {
        match self.bus.set_mailbox_data(self.mailbox_data) {
            Ok(()) => {
                self.mailbox_data = self.mailbox_data.wrapping_add(1);
                Ok(())
            }
            Err(err) => {
                error!("Writing mailbox data {} failed.", self.mailbox_data);
                Err(err)
            }
        }
    }

    pub fn is_rx_armed(&self) -> bool {
        self.rx_armed
    }
    /// Arm the header read for the first frame, once the host enabled the function.
    pub fn arm_rx(&mut self) -> BusResult<()> {
        if !self.rx_armed {
            self.bus.arm_rx_header()?;
            self.rx_armed = true;
        }
        Ok(())
    }

    /// Read the pending frame from the host into `buffer`.
    ///
    /// Returns [None], if no frame is pending. The header read for the next frame is armed,
    /// before the frame is parsed.
    pub async fn receive<'a>(
        &mut self,
        buffer: &'a mut [u8],
    ) -> Result<Option<RxFrame<'a>>, RxError> {
        let Some(len) = self.bus.rx_frame_len() else {
            return Ok(None);
        };
        if len == 0 {
            error!("Incoming frame has length zero.");
            return Err(RxError::ZeroLength);
        }
        let Some(frame) = buffer.get_mut(..len as usize) else {
            error!("Incoming frame of {} bytes is too long.", len);
            if self.bus.discard_rx().is_err() {
                error!("Discarding the frame failed.");
            }
            self.rearm()?;
            return Err(RxError::Oversized(len));
        };
        if self.bus.read(frame).await.is_err() {
            error!("Reading frame payload failed.");
            self.rearm()?;
            return Err(RxError::ReadFailed);
        }
        self.rearm()?;
        let frame: &'a [u8] = frame;
        self.framer.parse(frame).map(Some).map_err(RxError::Malformed)
    }
    /// Arm the header read for the frame after the current one.
    fn rearm(&mut self) -> Result<(), RxError> {
        self.bus.arm_rx_header().map_err(|_| {
            error!("Arming the header read failed.");
            self.rx_armed = false;
            RxError::HeaderFailed
        })
    }
}
impl<Bus: HostBus, B> FrameSink for HostLink<Bus, B> {
    fn is_busy(&self) -> bool {
        self.bus.is_tx_busy()
    }
    async fn send_frame(
        &mut self,
        channel: Channel,
        payload: &[u8],
        bus_data_credit: u8,
    ) -> Result<(), SendError> {
        let len = self
            .framer
            .build(channel, payload, bus_data_credit, &mut self.tx_buffer)?;
        self.bus.write(&self.tx_buffer[..len]).await?;
        self.bus.mailbox_write(MAILBOX_FRAME_READY)?;
        Ok(())
    }
}
