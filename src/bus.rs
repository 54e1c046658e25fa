//! The capabilities, that the bridge consumes from the platform.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A bus transaction failed.
pub struct BusError;
pub type BusResult<T> = Result<T, BusError>;

/// Doorbell bit, that tells the host a frame is ready to be read.
pub const MAILBOX_FRAME_READY: u32 = 0x4;

/// The device side of the serial bus to the host.
///
/// The bus permits only one outstanding transaction at a time. Only the worker loop drives it.
#[allow(async_fn_in_trait)]
pub trait HostBus {
    /// Returns true, while a write to the host is in progress.
    fn is_tx_busy(&self) -> bool;
    /// The payload length from the hardware header of a frame from the host.
    ///
    /// Returns [None], if no frame is available.
    fn rx_frame_len(&mut self) -> Option<u16>;
    /// Read the payload of the pending frame into `buffer`.
    async fn read(&mut self, buffer: &mut [u8]) -> BusResult<()>;
    /// Drop the pending frame without reading it.
    fn discard_rx(&mut self) -> BusResult<()>;
    /// Arm the hardware to receive the header of the next frame.
    fn arm_rx_header(&mut self) -> BusResult<()>;
    /// Write a complete frame to the host.
    async fn write(&mut self, frame: &[u8]) -> BusResult<()>;
    /// Ring the doorbell of the host.
    fn mailbox_write(&mut self, bits: u32) -> BusResult<()>;
    /// Set the value of the to-host mailbox data register.
    fn set_mailbox_data(&mut self, data: u32) -> BusResult<()>;
}

/// A buffer handed out by a [BufferPool].
pub trait NetBuffer {
    /// The valid bytes of the buffer.
    fn as_slice(&self) -> &[u8];
    /// The entire usable space of the buffer.
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// The amount of bytes, that may be stored in the buffer.
    fn capacity(&self) -> usize;
    /// Set the amount of valid bytes.
    fn set_len(&mut self, len: usize);
}

/// The allocator for network buffers.
///
/// This is shared between the worker loop and the network stack.
pub trait BufferPool {
    type Buffer: NetBuffer;

    /// Get a buffer from the pool, if one is free.
    fn allocate(&self) -> Option<Self::Buffer>;
    /// Return a buffer to the pool.
    fn release(&self, buffer: Self::Buffer);
    /// The amount of free buffers.
    fn free_count(&self) -> usize;
}

/// The local network stack and the Wi-Fi link.
pub trait NetworkLink<B> {
    /// Inject a frame into the local IP stack.
    fn deliver_local(&self, buffer: B);
    /// Transmit a frame over the Wi-Fi link.
    fn transmit(&self, buffer: B);
}
