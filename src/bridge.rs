//! The bridge between the host, the local network stack and the Wi-Fi link.
//!
//! ## Structure
//! The [Bridge] holds all state, that is shared between contexts: the TX queue, the traffic
//! arbiter, the control message queue and the counters. It is used by the network stack to pass
//! frames in both directions, by the Wi-Fi connection manager to report events, and by interrupt
//! handlers to wake the worker loop.
//!
//! The bus itself is only ever driven by the [BridgeRunner], which is obtained once through
//! [Bridge::split]. It owns the [HostLink], so the sequence numbers and the reserved receive buffer
//! have a single writer.
//!
//! ## Worker loop
//! Every time the runner is woken up, it
//! 1. reserves a receive buffer, if it doesn't hold one, and tells the host it may send,
//! 2. reads frames from the host, as long as it holds a receive buffer, and writes a test pattern,
//!    if one was requested,
//! 3. drains the TX queue, until it's empty or the bus is busy,
//! 4. arms the buffer watchdog, if it still doesn't hold a receive buffer.

use alloc::vec::Vec;
use core::future::pending;

use embassy_futures::{
    select::{select3, Either3},
    yield_now,
};
use embassy_sync::channel;
use embassy_time::{Duration, Instant, Timer};
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    arbiter::{wire_length, Arbiter, ArbiterConfig, InboundDecision, OutboundAction},
    bus::{BufferPool, HostBus, NetBuffer, NetworkLink},
    command::{handle_command, AtCommandBuffer, AtReadError, CommandQueue, HostedControl},
    event::{encode_at_event, encode_user_event, NetworkEvent, ScanEvent},
    link::{HostLink, RxError},
    sdpcm::{Channel, RxFrame, MAX_FRAME_LEN, MAX_PAYLOAD_LEN},
    stats::{BridgeStats, Counter, RxStats, TxStats},
    sync::{ShutdownSignal, WakeChannel, WakeSource},
    tx_queue::{DrainError, FrameSink, QueueFull, TxPayload, TxQueue},
    DefaultRawMutex,
};

/// Port, that iperf listens on.
pub const DEFAULT_WHITELIST_PORT: u16 = 5001;
const WAKE_DEPTH: usize = 4;
const HOST_MESSAGE_DEPTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub arbiter: ArbiterConfig,
    /// The period of the watchdog, while no receive buffer can be reserved.
    pub watchdog_period: Duration,
    /// How long the flood test writes frames to the host.
    pub flood_duration: Duration,
    /// Ports, that are whitelisted from the start.
    pub whitelist: &'static [u16],
}
impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            arbiter: ArbiterConfig::default(),
            watchdog_period: Duration::from_millis(10),
            flood_duration: Duration::from_secs(60),
            whitelist: &[DEFAULT_WHITELIST_PORT],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A frame from the host on a channel, that the bridge doesn't interpret.
pub struct HostMessage {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThroughputResult {
    pub frames: u32,
    pub bytes: u32,
    /// Frames of the flood test, that couldn't be written.
    pub errors: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A pattern of data frames, that is written to the host for testing it's receive path.
enum RxPattern {
    /// One frame of every payload length, from empty to full.
    Increasing,
    /// One frame of every payload length, from full to empty.
    Decreasing,
    /// Full frames, until the flood duration elapsed.
    Flood,
}

/// Counts the frames of a throughput test, while it is running.
struct ThroughputTest {
    active: AtomicBool,
    frames: Counter,
    bytes: Counter,
    errors: Counter,
    requested: AtomicU32,
}
impl ThroughputTest {
    const START: u32 = 1;
    const STOP: u32 = 2;
    const RX_INCREASING: u32 = 3;
    const RX_DECREASING: u32 = 4;
    const RX_FLOOD: u32 = 5;

    const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            frames: Counter::new(),
            bytes: Counter::new(),
            errors: Counter::new(),
            requested: AtomicU32::new(0),
        }
    }
    fn start(&self) {
        self.frames.reset();
        self.bytes.reset();
        self.errors.reset();
        self.active.store(true, Ordering::Relaxed);
    }
    fn stop(&self) -> ThroughputResult {
        self.active.store(false, Ordering::Relaxed);
        self.result()
    }
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
    fn record(&self, len: usize) {
        if self.is_active() {
            self.frames.increment();
            self.bytes.add(len as u32);
        }
    }
    fn record_error(&self) {
        if self.is_active() {
            self.errors.increment();
        }
    }
    fn request(&self, command: u32) {
        self.requested.store(command, Ordering::Relaxed);
    }
    /// The pattern, that was requested since the last call.
    fn take_pattern(&self) -> Option<RxPattern> {
        match self.requested.swap(0, Ordering::Relaxed) {
            Self::RX_INCREASING => Some(RxPattern::Increasing),
            Self::RX_DECREASING => Some(RxPattern::Decreasing),
            Self::RX_FLOOD => Some(RxPattern::Flood),
            _ => None,
        }
    }
    fn result(&self) -> ThroughputResult {
        ThroughputResult {
            frames: self.frames.get(),
            bytes: self.bytes.get(),
            errors: self.errors.get(),
        }
    }
}

#[derive(Default)]
struct RxCounters {
    zero_length: Counter,
    read_failed: Counter,
    header_failed: Counter,
    malformed: Counter,
    sequence_gaps: Counter,
    received: Counter,
    buffer_exhausted: Counter,
    unhandled_channel: Counter,
    command_dropped: Counter,
    command_rejected: Counter,
}
impl RxCounters {
    fn count_error(&self, err: RxError) {
        match err {
            RxError::ZeroLength => self.zero_length.increment(),
            RxError::Oversized(_) | RxError::ReadFailed => self.read_failed.increment(),
            RxError::HeaderFailed => self.header_failed.increment(),
            RxError::Malformed(_) => self.malformed.increment(),
        }
    }
    fn snapshot(&self) -> RxStats {
        RxStats {
            zero_length: self.zero_length.get(),
            read_failed: self.read_failed.get(),
            header_failed: self.header_failed.get(),
            malformed: self.malformed.get(),
            sequence_gaps: self.sequence_gaps.get(),
            received: self.received.get(),
            buffer_exhausted: self.buffer_exhausted.get(),
            unhandled_channel: self.unhandled_channel.get(),
            command_dropped: self.command_dropped.get(),
            command_rejected: self.command_rejected.get(),
        }
    }
}

/// The shared state of the bridge.
pub struct Bridge<P: BufferPool, L> {
    pool: P,
    network: L,
    config: BridgeConfig,
    arbiter: Arbiter,
    tx_queue: TxQueue<P::Buffer>,
    commands: CommandQueue,
    at_buffer: AtCommandBuffer,
    host_messages: channel::Channel<DefaultRawMutex, HostMessage, HOST_MESSAGE_DEPTH>,
    wake: WakeChannel<WAKE_DEPTH>,
    shutdown: ShutdownSignal,
    host_ready: AtomicBool,
    runner_taken: AtomicBool,
    worker_active: AtomicBool,
    watchdog_armed: AtomicBool,
    throughput: ThroughputTest,
    rx: RxCounters,
    data_dropped: Counter,
    event_dropped: Counter,
    response_dropped: Counter,
}
impl<P: BufferPool, L: NetworkLink<P::Buffer>> Bridge<P, L> {
    pub fn new(pool: P, network: L, config: BridgeConfig) -> Self {
        let bridge = Self {
            pool,
            network,
            config,
            arbiter: Arbiter::new(config.arbiter),
            tx_queue: TxQueue::new(),
            commands: CommandQueue::new(),
            at_buffer: AtCommandBuffer::new(),
            host_messages: channel::Channel::new(),
            wake: WakeChannel::new(),
            shutdown: ShutdownSignal::new(),
            host_ready: AtomicBool::new(false),
            runner_taken: AtomicBool::new(false),
            worker_active: AtomicBool::new(false),
            watchdog_armed: AtomicBool::new(false),
            throughput: ThroughputTest::new(),
            rx: RxCounters::default(),
            data_dropped: Counter::new(),
            event_dropped: Counter::new(),
            response_dropped: Counter::new(),
        };
        for port in config.whitelist {
            if bridge.arbiter.add_whitelist_port(*port).is_err() {
                warn!("Whitelist is full, port {} not added.", port);
            }
        }
        bridge
    }
    /// Get the runner, that drives the bus.
    ///
    /// This returns [None], if the runner was already taken.
    pub fn split<Bus: HostBus>(&self, bus: Bus) -> Option<BridgeRunner<'_, Bus, P, L>> {
        if self.runner_taken.swap(true, Ordering::Relaxed) {
            return None;
        }
        self.shutdown.reset();
        Some(BridgeRunner {
            bridge: self,
            link: HostLink::new(bus),
            rx_buffer: alloc::vec![0; MAX_FRAME_LEN],
            watchdog: None,
        })
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }
    pub fn network(&self) -> &L {
        &self.network
    }
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
    /// The traffic arbiter, which also holds the port whitelist.
    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Wake the worker loop.
    ///
    /// This is what the bus interrupt handler calls, once a frame from the host is available.
    pub fn wake(&self, source: WakeSource) {
        self.wake.wake(source);
    }
    /// Stop the worker loop.
    pub fn shutdown(&self) {
        self.shutdown.signal();
    }
    /// Called once the host enabled the function and is ready to exchange frames.
    pub fn set_host_ready(&self, ready: bool) {
        if self.host_ready.swap(ready, Ordering::Relaxed) != ready {
            debug!("Host ready: {}", ready);
        }
        if ready {
            self.wake(WakeSource::RxDone);
        }
    }
    pub fn is_host_ready(&self) -> bool {
        self.host_ready.load(Ordering::Relaxed)
    }
    /// Whether the worker loop is running or waiting for buffers.
    ///
    /// The system shouldn't enter a low power state, while this is true.
    pub fn is_busy(&self) -> bool {
        self.worker_active.load(Ordering::Relaxed) || self.watchdog_armed.load(Ordering::Relaxed)
    }

    fn enqueue_heap(&self, channel: Channel, payload: Vec<u8>) -> bool {
        match self.tx_queue.enqueue(channel, TxPayload::Heap(payload)) {
            Ok(()) => {
                self.wake(WakeSource::Enqueue);
                true
            }
            Err(_) => false,
        }
    }
    fn send_event(&self, event: Vec<u8>) -> bool {
        if !self.is_host_ready() {
            trace!("Host isn't ready, event dropped.");
            return false;
        }
        if !self.enqueue_heap(Channel::Event, event) {
            self.event_dropped.increment();
            error!("Queueing event failed.");
            return false;
        }
        true
    }

    /// Handle a frame received from the Wi-Fi link.
    ///
    /// Frames belonging to the local stack are delivered to it, all others are queued for the
    /// host. If the queue is full, the frame is dropped.
    pub fn process_ethernet_data(&self, buffer: P::Buffer) {
        match self.arbiter.classify_inbound(buffer.as_slice(), Instant::now()) {
            InboundDecision::DeliverLocally => self.network.deliver_local(buffer),
            InboundDecision::ForwardToBus => {
                match self.tx_queue.enqueue(Channel::Data, TxPayload::Network(buffer)) {
                    Ok(()) => self.wake(WakeSource::Enqueue),
                    Err(QueueFull(payload)) => {
                        self.data_dropped.increment();
                        if let TxPayload::Network(buffer) = payload {
                            self.pool.release(buffer);
                        }
                    }
                }
            }
        }
    }
    /// Send a frame from the local stack over the Wi-Fi link.
    ///
    /// Returns false, if the frame was malformed and therefore dropped.
    pub fn send_from_local_stack(&self, mut buffer: P::Buffer) -> bool {
        let decision = self
            .arbiter
            .classify_outbound(buffer.as_slice(), Instant::now());
        match decision.action {
            OutboundAction::Forward => {
                buffer.set_len(decision.length);
                self.network.transmit(buffer);
                true
            }
            OutboundAction::Drop => {
                self.pool.release(buffer);
                false
            }
        }
    }
    /// Forward a data frame from the host to the Wi-Fi link.
    fn forward_host_data(&self, mut buffer: P::Buffer, data: &[u8]) {
        let Some(target) = buffer.as_mut_slice().get_mut(..data.len()) else {
            self.rx.malformed.increment();
            error!("Data frame of {} bytes doesn't fit into a buffer.", data.len());
            self.pool.release(buffer);
            return;
        };
        target.copy_from_slice(data);
        buffer.set_len(wire_length(data).unwrap_or(data.len()));
        self.network.transmit(buffer);
    }

    /// Report a change of the connection state to the host.
    ///
    /// This also starts or stops the periodic sweep of the arbiter.
    pub fn network_event(&self, event: NetworkEvent) -> bool {
        if let Some(link_up) = event.link_up() {
            self.arbiter.set_sweeping(link_up);
        }
        self.send_event(event.encode())
    }
    pub fn scan_event(&self, event: &ScanEvent) -> bool {
        self.send_event(event.encode())
    }
    /// Send the output of an AT command to the host.
    pub fn at_event(&self, text: &[u8]) -> bool {
        self.send_event(encode_at_event(text))
    }
    /// Send a raw message on the AT command channel.
    pub fn send_at_message(&self, data: &[u8]) -> bool {
        if !self.enqueue_heap(Channel::AtCommand, data.to_vec()) {
            self.event_dropped.increment();
            return false;
        }
        true
    }
    /// Send a user defined event. Returns false, if it's too long or couldn't be queued.
    pub fn user_event(&self, data: &[u8]) -> bool {
        match encode_user_event(data) {
            Some(event) => self.send_event(event),
            None => {
                error!("User event of {} bytes is too long.", data.len());
                false
            }
        }
    }

    pub fn is_at_command_ready(&self) -> bool {
        self.at_buffer.is_data_ready()
    }
    /// Take the AT command, that the host sent.
    pub fn read_at_command(&self, out: &mut [u8]) -> Result<usize, AtReadError> {
        self.at_buffer.read(out)
    }
    /// Wait for a frame on one of the channels, that are passed through.
    pub async fn receive_host_message(&self) -> HostMessage {
        self.host_messages.receive().await
    }

    /// Handle control messages from the host.
    pub async fn run_commands<C: HostedControl>(&self, control: &mut C) -> ! {
        loop {
            let message = self.commands.receive().await;
            self.execute_command(&message, control).await;
        }
    }
    async fn execute_command<C: HostedControl>(&self, message: &[u8], control: &mut C) {
        let result = handle_command(message, control, &self.at_buffer, |response| {
            if !self.enqueue_heap(Channel::Control, response) {
                self.response_dropped.increment();
                error!("Queueing command response failed.");
            }
        })
        .await;
        if result.is_err() {
            self.rx.command_rejected.increment();
        }
    }
    /// Periodically sweep stale sessions, while the Wi-Fi link is up.
    pub async fn run_sweeper(&self) -> ! {
        self.arbiter.run_sweeper().await
    }

    /// The result of the current or last throughput test.
    pub fn throughput(&self) -> ThroughputResult {
        self.throughput.result()
    }
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            tx: TxStats {
                enqueue_failed: self.tx_queue.enqueue_failed(),
                bus_busy: self.tx_queue.bus_busy(),
                send_failed: self.tx_queue.send_failed(),
                sent: self.tx_queue.sent(),
                data_dropped: self.data_dropped.get(),
                event_dropped: self.event_dropped.get(),
                response_dropped: self.response_dropped.get(),
            },
            rx: self.rx.snapshot(),
            arbiter: self.arbiter.stats(),
        }
    }

    fn test_command(&self, payload: &[u8]) {
        let Ok(command) = <[u8; 4]>::try_from(payload) else {
            error!("Test command of {} bytes has the wrong size.", payload.len());
            return;
        };
        match u32::from_le_bytes(command) {
            ThroughputTest::START => {
                debug!("Throughput test started.");
                self.throughput.start();
            }
            ThroughputTest::STOP => {
                let result = self.throughput.stop();
                info!(
                    "Throughput test: {} frames, {} bytes.",
                    result.frames, result.bytes
                );
            }
            pattern @ (ThroughputTest::RX_INCREASING
            | ThroughputTest::RX_DECREASING
            | ThroughputTest::RX_FLOOD) => self.throughput.request(pattern),
            other => error!("Unsupported test command {}.", other),
        }
    }
}

/// Drives the bus. See the [module documentation](self).
pub struct BridgeRunner<'a, Bus, P: BufferPool, L> {
    bridge: &'a Bridge<P, L>,
    link: HostLink<Bus, P::Buffer>,
    rx_buffer: Vec<u8>,
    watchdog: Option<Instant>,
}
impl<Bus: HostBus, P: BufferPool, L: NetworkLink<P::Buffer>> BridgeRunner<'_, Bus, P, L> {
    pub fn link(&self) -> &HostLink<Bus, P::Buffer> {
        &self.link
    }
    /// Run the worker loop, until [Bridge::shutdown] is called.
    ///
    /// On shutdown, the reserved buffer and all queued frames are released.
    pub async fn run(&mut self) {
        let bridge = self.bridge;
        info!("Bridge worker started.");
        loop {
            let deadline = self.watchdog;
            let watchdog = async {
                match deadline {
                    Some(deadline) => Timer::at(deadline).await,
                    None => pending::<()>().await,
                }
            };
            match select3(bridge.shutdown.wait(), bridge.wake.next(), watchdog).await {
                Either3::First(()) => break,
                Either3::Second(source) => {
                    trace!("Woken up by {:?}.", source);
                    self.service().await;
                }
                Either3::Third(()) => self.watchdog_expired(),
            }
        }
        self.link.release_reserved_buffer(&bridge.pool);
        bridge.tx_queue.clear(&bridge.pool);
        bridge.watchdog_armed.store(false, Ordering::Relaxed);
        info!("Bridge worker stopped.");
    }
    fn watchdog_expired(&mut self) {
        let bridge = self.bridge;
        if bridge.pool.free_count() == 0 {
            self.watchdog = Some(Instant::now() + bridge.config.watchdog_period);
        } else {
            self.watchdog = None;
            bridge.watchdog_armed.store(false, Ordering::Relaxed);
            bridge.wake(WakeSource::Watchdog);
        }
    }
    /// One pass of the worker loop.
    async fn service(&mut self) {
        let bridge = self.bridge;
        bridge.worker_active.store(true, Ordering::Relaxed);

        if bridge.is_host_ready() && !self.link.is_rx_armed() && self.link.arm_rx().is_err() {
            error!("Arming the first header read failed.");
        }

        if !self.link.has_reserved_buffer() {
            if self.link.reserve_buffer(&bridge.pool) {
                let _ = self.link.notify_host();
            } else {
                bridge.rx.buffer_exhausted.increment();
            }
        }

        while self.link.has_reserved_buffer() {
            match self.link.receive(&mut self.rx_buffer).await {
                Ok(Some(frame)) => Self::dispatch(bridge, &mut self.link, frame),
                Ok(None) => break,
                Err(err) => {
                    bridge.rx.count_error(err);
                    break;
                }
            }
        }

        if let Some(pattern) = bridge.throughput.take_pattern() {
            self.run_rx_test(pattern).await;
        }

        loop {
            match bridge.tx_queue.drain_one(&mut self.link, &bridge.pool).await {
                Ok(()) | Err(DrainError::SendFailed(_)) => {}
                Err(DrainError::Empty) => break,
                Err(DrainError::BusBusy) => {
                    yield_now().await;
                    bridge.wake(WakeSource::TxRetry);
                    break;
                }
            }
        }

        if !self.link.has_reserved_buffer() && self.watchdog.is_none() {
            debug!("No receive buffer, arming watchdog.");
            self.watchdog = Some(Instant::now() + bridge.config.watchdog_period);
            bridge.watchdog_armed.store(true, Ordering::Relaxed);
        }
        bridge.worker_active.store(false, Ordering::Relaxed);
    }
    /// Write a test pattern straight to the bus.
    ///
    /// Nothing else is sent or received, until the pattern is complete.
    async fn run_rx_test(&mut self, pattern: RxPattern) {
        let bridge = self.bridge;
        let payload: Vec<u8> = (0..MAX_PAYLOAD_LEN).map(|i| i as u8).collect();
        info!("RX test {:?} started.", pattern);
        match pattern {
            RxPattern::Increasing => {
                for len in 0..=MAX_PAYLOAD_LEN {
                    self.send_test_frame(&payload[..len]).await;
                }
            }
            RxPattern::Decreasing => {
                for len in (0..=MAX_PAYLOAD_LEN).rev() {
                    self.send_test_frame(&payload[..len]).await;
                }
            }
            RxPattern::Flood => {
                bridge.throughput.start();
                let deadline = Instant::now() + bridge.config.flood_duration;
                while Instant::now() < deadline {
                    self.send_test_frame(&payload).await;
                }
                let result = bridge.throughput.stop();
                info!(
                    "Flood test: {} frames, {} errors, {} bytes.",
                    result.frames, result.errors, result.bytes
                );
            }
        }
        info!("RX test {:?} finished.", pattern);
    }
    async fn send_test_frame(&mut self, payload: &[u8]) {
        while self.link.is_busy() {
            yield_now().await;
        }
        let credit = self.bridge.pool.free_count().min(u8::MAX as usize) as u8;
        match self.link.send_frame(Channel::Data, payload, credit).await {
            Ok(()) => self.bridge.throughput.record(payload.len()),
            Err(_) => self.bridge.throughput.record_error(),
        }
    }
    fn dispatch(bridge: &Bridge<P, L>, link: &mut HostLink<Bus, P::Buffer>, frame: RxFrame<'_>) {
        bridge.rx.received.increment();
        if frame.missed != 0 {
            bridge.rx.sequence_gaps.increment();
        }
        let channel = frame.channel();

        // Data frames consume the reserved buffer, so we only let the host send more, once we
        // reserved a new one.
        let mut data_buffer = None;
        let ready_for_next = if channel == Channel::Data {
            data_buffer = link.take_reserved_buffer();
            link.reserve_buffer(&bridge.pool)
        } else {
            true
        };
        if ready_for_next {
            let _ = link.notify_host();
        } else {
            bridge.rx.buffer_exhausted.increment();
        }

        match channel {
            Channel::Control => {
                if bridge.commands.try_enqueue(frame.payload).is_err() {
                    bridge.rx.command_dropped.increment();
                    error!("Control message queue is full.");
                }
            }
            Channel::Data => {
                let Some(buffer) = data_buffer else {
                    return;
                };
                match frame.data() {
                    Ok(data) => bridge.forward_host_data(buffer, data),
                    Err(_) => {
                        bridge.rx.malformed.increment();
                        bridge.pool.release(buffer);
                    }
                }
            }
            Channel::Event | Channel::AtCommand | Channel::Log => {
                let message = HostMessage {
                    channel,
                    payload: frame.payload.to_vec(),
                };
                if bridge.host_messages.try_send(message).is_err() {
                    bridge.rx.unhandled_channel.increment();
                    debug!("No consumer for a frame on channel {:?}.", channel);
                }
            }
            Channel::WriteTest => bridge.throughput.record(frame.payload.len()),
            Channel::Loopback => {
                if !bridge.enqueue_heap(Channel::WriteTest, frame.payload.to_vec()) {
                    bridge.event_dropped.increment();
                }
            }
            Channel::TestCommand => bridge.test_command(frame.payload),
            Channel::Glom | Channel::Unknown(_) => {
                bridge.rx.unhandled_channel.increment();
                debug!("Frame on unhandled channel {:?}.", channel);
            }
        }
    }
}
