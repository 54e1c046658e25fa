//! Fakes of the platform capabilities.

use alloc::{collections::VecDeque, vec::Vec};
use core::cell::{Cell, RefCell};

use crate::{
    bus::{BufferPool, BusError, BusResult, HostBus, NetBuffer, NetworkLink},
    sdpcm::MAX_FRAME_LEN,
};

#[derive(Default, Debug)]
pub struct MockBuffer {
    bytes: Vec<u8>,
    len: usize,
}
impl NetBuffer for MockBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
    fn capacity(&self) -> usize {
        self.bytes.len()
    }
    fn set_len(&mut self, len: usize) {
        self.len = len.min(self.bytes.len());
    }
}

/// A pool, that only counts the buffers handed out.
pub struct MockPool {
    free: Cell<usize>,
}
impl MockPool {
    pub fn new(buffers: usize) -> Self {
        Self {
            free: Cell::new(buffers),
        }
    }
    pub fn allocate_with(&self, bytes: &[u8]) -> Option<MockBuffer> {
        let mut buffer = self.allocate()?;
        buffer.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        buffer.set_len(bytes.len());
        Some(buffer)
    }
}
impl BufferPool for MockPool {
    type Buffer = MockBuffer;

    fn allocate(&self) -> Option<MockBuffer> {
        let free = self.free.get();
        if free == 0 {
            return None;
        }
        self.free.set(free - 1);
        Some(MockBuffer {
            bytes: alloc::vec![0; MAX_FRAME_LEN],
            len: 0,
        })
    }
    fn release(&self, _buffer: MockBuffer) {
        self.free.set(self.free.get() + 1);
    }
    fn free_count(&self) -> usize {
        self.free.get()
    }
}

#[derive(Default)]
pub struct MockBus {
    pub rx: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
    pub doorbells: Vec<u32>,
    pub mailbox_data: Vec<u32>,
    /// How often the header read was armed.
    pub armed: usize,
    pub tx_busy: bool,
    pub fail_read: bool,
    pub fail_arm: bool,
    pub fail_write: bool,
    pub fail_mailbox: bool,
    /// Writes fail, once this many frames were written.
    pub max_writes: Option<usize>,
}
impl MockBus {
    pub fn push_rx(&mut self, frame: &[u8]) {
        self.rx.push_back(frame.to_vec());
    }
}
impl HostBus for MockBus {
    fn is_tx_busy(&self) -> bool {
        self.tx_busy
    }
    fn rx_frame_len(&mut self) -> Option<u16> {
        let len = self.rx.front()?.len() as u16;
        if len == 0 {
            self.rx.pop_front();
        }
        Some(len)
    }
    async fn read(&mut self, buffer: &mut [u8]) -> BusResult<()> {
        let frame = self.rx.pop_front().ok_or(BusError)?;
        if self.fail_read {
            return Err(BusError);
        }
        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(())
    }
    fn discard_rx(&mut self) -> BusResult<()> {
        self.rx.pop_front().map(|_| ()).ok_or(BusError)
    }
    fn arm_rx_header(&mut self) -> BusResult<()> {
        if self.fail_arm {
            return Err(BusError);
        }
        self.armed += 1;
        Ok(())
    }
    async fn write(&mut self, frame: &[u8]) -> BusResult<()> {
        if self.fail_write || self.max_writes.is_some_and(|max| self.written.len() >= max) {
            return Err(BusError);
        }
        self.written.push(frame.to_vec());
        Ok(())
    }
    fn mailbox_write(&mut self, bits: u32) -> BusResult<()> {
        self.doorbells.push(bits);
        Ok(())
    }
    fn set_mailbox_data(&mut self, data: u32) -> BusResult<()> {
        if self.fail_mailbox {
            return Err(BusError);
        }
        self.mailbox_data.push(data);
        Ok(())
    }
}

/// Records the frames handed to the local stack and the Wi-Fi link.
#[derive(Default)]
pub struct MockLink {
    pub delivered: RefCell<Vec<Vec<u8>>>,
    pub transmitted: RefCell<Vec<Vec<u8>>>,
}
impl NetworkLink<MockBuffer> for MockLink {
    fn deliver_local(&self, buffer: MockBuffer) {
        self.delivered.borrow_mut().push(buffer.as_slice().to_vec());
    }
    fn transmit(&self, buffer: MockBuffer) {
        self.transmitted.borrow_mut().push(buffer.as_slice().to_vec());
    }
}
