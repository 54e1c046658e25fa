//! # `sdio-hosted`
//! The device side of a hosted mode Wi-Fi bridge. An external host processor is connected over a
//! serial bus (SDIO or SPI) and uses this device as it's network interface, while the device
//! keeps running it's own IP stack on the same Wi-Fi link.
//!
//! ## Framing
//! All traffic between the host and the device is multiplexed over the bus. Every frame carries an
//! eight byte software header, which contains a sequence number, the logical channel and the
//! amount of free receive buffers, which serves as flow control credit for the host. See
//! [sdpcm] for the layout. Control messages use the BCDC header from [bcdc], events the header
//! from [event].
//!
//! ## Traffic arbitration
//! Frames received over Wi-Fi either belong to the local stack or to the host. The [Arbiter]
//! decides this per frame. Flows opened by the local stack are tracked in a session table, so that
//! replies can be matched to them. ARP replies are matched to outstanding requests the same way.
//! Traffic to whitelisted ports always stays local. Everything else is queued for the host.
//!
//! ## Concurrency
//! The bus only permits one transaction at a time, so there is exactly one context driving it: the
//! [BridgeRunner]. All other contexts (the bus interrupt, the network stack, the command task and
//! the watchdog) only push wake tokens into a bounded channel, which the runner consumes. All
//! tables and queues shared between these contexts are behind blocking mutexes, which are never
//! held across a bus transaction.
//!
//! With the `critical_section` feature, these mutexes are backed by a critical section, so the
//! bridge may be shared with interrupt handlers. Otherwise everything has to run on one executor.
//!
//! ## Platform
//! The bus, the buffer pool, the network stack and the Wi-Fi connection manager are supplied by
//! the platform through the traits in [bus] and [HostedControl].

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub(crate) mod fmt;

pub mod arbiter;
pub mod arp;
pub mod bcdc;
mod bridge;
pub mod bus;
mod command;
pub mod event;
mod link;
pub mod packet;
pub mod sdpcm;
pub mod session;
mod stats;
mod sync;
#[cfg(test)]
mod test_util;
mod tx_queue;
pub mod whitelist;

pub use arbiter::{Arbiter, ArbiterConfig};
pub use bridge::*;
pub use command::*;
pub use link::{HostLink, RxError};
pub use stats::*;
pub use sync::{ShutdownSignal, WakeChannel, WakeSource};
pub use tx_queue::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
