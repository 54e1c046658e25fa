use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    bus::{BufferPool, BusError, NetBuffer},
    sdpcm::{Channel, FrameError},
    stats::Counter,
    DefaultRawMutex,
};

/// The contents of a frame waiting for transmission.
pub enum TxPayload<B> {
    /// A buffer from the network buffer pool, which is released after transmission.
    Network(B),
    /// A heap allocated message, like a command response or an event.
    Heap(Vec<u8>),
}
impl<B: NetBuffer> TxPayload<B> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Network(buffer) => buffer.as_slice(),
            Self::Heap(bytes) => bytes.as_slice(),
        }
    }
}

/// A queued frame.
pub struct TxNode<B> {
    pub channel: Channel,
    pub payload: TxPayload<B>,
}

/// All nodes are in use. The payload is handed back, so the caller can release it.
pub struct QueueFull<B>(pub TxPayload<B>);
impl<B> core::fmt::Debug for QueueFull<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("QueueFull")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    Frame(FrameError),
    Bus(BusError),
}
impl From<FrameError> for SendError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}
impl From<BusError> for SendError {
    fn from(value: BusError) -> Self {
        Self::Bus(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrainError {
    /// There is nothing to send.
    Empty,
    /// The bus is still busy with a previous transaction.
    BusBusy,
    /// The frame couldn't be sent and was dropped.
    SendFailed(SendError),
}

/// Something, that frames can be written to.
#[allow(async_fn_in_trait)]
pub trait FrameSink {
    fn is_busy(&self) -> bool;
    /// Frame `payload` and write it out.
    async fn send_frame(
        &mut self,
        channel: Channel,
        payload: &[u8],
        bus_data_credit: u8,
    ) -> Result<(), SendError>;
}

/// A FIFO ring of nodes.
///
/// The free slots make up the idle pool.
struct WaitQueue<B, const NODES: usize> {
    nodes: [Option<TxNode<B>>; NODES],
    head: usize,
    len: usize,
}
impl<B, const NODES: usize> WaitQueue<B, NODES> {
    const fn new() -> Self {
        Self {
            nodes: [const { None }; NODES],
            head: 0,
            len: 0,
        }
    }
    fn push_back(&mut self, node: TxNode<B>) -> Result<(), TxNode<B>> {
        if self.len == NODES {
            return Err(node);
        }
        self.nodes[(self.head + self.len) % NODES] = Some(node);
        self.len += 1;
        Ok(())
    }
    fn pop_front(&mut self) -> Option<TxNode<B>> {
        if self.len == 0 {
            return None;
        }
        let node = self.nodes[self.head].take();
        self.head = (self.head + 1) % NODES;
        self.len -= 1;
        node
    }
}

/// The queue of frames waiting to be sent to the host.
///
/// It has a fixed amount of nodes, so enqueueing fails once all of them are waiting.
pub struct TxQueue<B, const NODES: usize = 10> {
    queue: blocking_mutex::Mutex<DefaultRawMutex, RefCell<WaitQueue<B, NODES>>>,
    enqueue_failed: Counter,
    bus_busy: Counter,
    send_failed: Counter,
    sent: Counter,
}
impl<B: NetBuffer, const NODES: usize> TxQueue<B, NODES> {
    pub const fn new() -> Self {
        Self {
            queue: blocking_mutex::Mutex::new(RefCell::new(WaitQueue::new())),
            enqueue_failed: Counter::new(),
            bus_busy: Counter::new(),
            send_failed: Counter::new(),
            sent: Counter::new(),
        }
    }
    /// The amount of frames waiting for transmission.
    pub fn len(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The amount of free nodes.
    pub fn idle_count(&self) -> usize {
        NODES - self.len()
    }
    /// Queue a frame for transmission.
    pub fn enqueue(&self, channel: Channel, payload: TxPayload<B>) -> Result<(), QueueFull<B>> {
        let result = self
            .queue
            .lock(|queue| queue.borrow_mut().push_back(TxNode { channel, payload }));
        result.map_err(|node| {
            self.enqueue_failed.increment();
            debug!("No idle TX node for a frame on channel {:?}.", channel);
            QueueFull(node.payload)
        })
    }
    /// Send the oldest queued frame.
    ///
    /// This does nothing, if the sink is busy. The frame is dropped, if sending fails. In both
    /// cases the buffer is released.
    pub async fn drain_one<S: FrameSink, P: BufferPool<Buffer = B>>(
        &self,
        sink: &mut S,
        pool: &P,
    ) -> Result<(), DrainError> {
        if self.is_empty() {
            return Err(DrainError::Empty);
        }
        if sink.is_busy() {
            self.bus_busy.increment();
            return Err(DrainError::BusBusy);
        }
        let node = self
            .queue
            .lock(|queue| queue.borrow_mut().pop_front())
            .ok_or(DrainError::Empty)?;
        let bus_data_credit = pool.free_count().min(u8::MAX as usize) as u8;
        let result = sink
            .send_frame(node.channel, node.payload.as_slice(), bus_data_credit)
            .await;
        if let TxPayload::Network(buffer) = node.payload {
            pool.release(buffer);
        }
        match result {
            Ok(()) => {
                self.sent.increment();
                Ok(())
            }
            Err(err) => {
                self.send_failed.increment();
                error!("Sending frame on channel {:?} failed: {:?}", node.channel, err);
                Err(DrainError::SendFailed(err))
            }
        }
    }
    /// Drop all queued frames.
    pub fn clear<P: BufferPool<Buffer = B>>(&self, pool: &P) {
        while let Some(node) = self.queue.lock(|queue| queue.borrow_mut().pop_front()) {
            if let TxPayload::Network(buffer) = node.payload {
                pool.release(buffer);
            }
        }
    }
    pub fn enqueue_failed(&self) -> u32 {
        self.enqueue_failed.get()
    }
    pub fn bus_busy(&self) -> u32 {
        self.bus_busy.get()
    }
    pub fn send_failed(&self) -> u32 {
        self.send_failed.get()
    }
    pub fn sent(&self) -> u32 {
        self.sent.get()
    }
}
impl<B: NetBuffer, const NODES: usize> Default for TxQueue<B, NODES> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::test_util::{MockBuffer, MockPool};

    #[derive(Default)]
    struct RecordingSink {
        busy: bool,
        fail: bool,
        frames: Vec<(Channel, Vec<u8>, u8)>,
    }
    impl FrameSink for RecordingSink {
        fn is_busy(&self) -> bool {
            self.busy
        }
        async fn send_frame(
            &mut self,
            channel: Channel,
            payload: &[u8],
            bus_data_credit: u8,
        ) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::Bus(BusError));
            }
            self.frames.push((channel, payload.to_vec(), bus_data_credit));
            Ok(())
        }
    }

    fn heap(byte: u8) -> TxPayload<MockBuffer> {
        TxPayload::Heap(vec![byte])
    }

    #[test]
    fn capacity_is_bounded() {
        let queue = TxQueue::<MockBuffer, 3>::new();
        let pool = MockPool::new(4);
        let mut sink = RecordingSink::default();
        for byte in 0..3 {
            assert!(queue.enqueue(Channel::Event, heap(byte)).is_ok());
        }
        assert_eq!(queue.idle_count(), 0);
        let Err(QueueFull(TxPayload::Heap(returned))) = queue.enqueue(Channel::Event, heap(3))
        else {
            panic!("enqueue on a full queue succeeded");
        };
        assert_eq!(returned, vec![3]);
        assert_eq!(queue.enqueue_failed(), 1);

        assert_eq!(block_on(queue.drain_one(&mut sink, &pool)), Ok(()));
        assert!(queue.enqueue(Channel::Event, heap(3)).is_ok());
    }

    #[test]
    fn drains_in_fifo_order() {
        let queue = TxQueue::<MockBuffer, 4>::new();
        let pool = MockPool::new(2);
        let mut sink = RecordingSink::default();
        queue.enqueue(Channel::Control, heap(1)).unwrap();
        queue.enqueue(Channel::Event, heap(2)).unwrap();
        while block_on(queue.drain_one(&mut sink, &pool)).is_ok() {}
        assert_eq!(
            sink.frames,
            vec![(Channel::Control, vec![1], 2), (Channel::Event, vec![2], 2)]
        );
        assert_eq!(
            block_on(queue.drain_one(&mut sink, &pool)),
            Err(DrainError::Empty)
        );
        assert_eq!(queue.sent(), 2);
    }

    #[test]
    fn busy_sink_keeps_frame() {
        let queue = TxQueue::<MockBuffer, 4>::new();
        let pool = MockPool::new(2);
        let mut sink = RecordingSink {
            busy: true,
            ..Default::default()
        };
        queue.enqueue(Channel::Event, heap(1)).unwrap();
        assert_eq!(
            block_on(queue.drain_one(&mut sink, &pool)),
            Err(DrainError::BusBusy)
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bus_busy(), 1);
    }

    #[test]
    fn network_buffers_are_released() {
        let queue = TxQueue::<MockBuffer, 4>::new();
        let pool = MockPool::new(2);
        let mut sink = RecordingSink::default();
        let buffer = pool.allocate_with(&[0xde, 0xad]).unwrap();
        queue
            .enqueue(Channel::Data, TxPayload::Network(buffer))
            .unwrap();
        assert_eq!(pool.free_count(), 1);
        block_on(queue.drain_one(&mut sink, &pool)).unwrap();
        assert_eq!(pool.free_count(), 2);
        // The credit was taken while the buffer was still in flight.
        assert_eq!(sink.frames, vec![(Channel::Data, vec![0xde, 0xad], 1)]);
    }

    #[test]
    fn failed_send_drops_frame() {
        let queue = TxQueue::<MockBuffer, 4>::new();
        let pool = MockPool::new(1);
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let buffer = pool.allocate_with(&[1]).unwrap();
        queue
            .enqueue(Channel::Data, TxPayload::Network(buffer))
            .unwrap();
        assert_eq!(
            block_on(queue.drain_one(&mut sink, &pool)),
            Err(DrainError::SendFailed(SendError::Bus(BusError)))
        );
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 1);
        assert_eq!(queue.send_failed(), 1);
    }
}
