//! Control messages from the host.
//!
//! Messages are queued by the worker loop and processed by a separate task, since handling them
//! may block on the Wi-Fi stack for a long time. Responses are sent back on the control channel.

use alloc::vec::Vec;
use core::{cell::RefCell, net::Ipv4Addr};

use embassy_sync::{blocking_mutex, channel};

use crate::{
    bcdc::{BcdcError, BcdcHeader, CommandId, BCDC_HEADER_LEN},
    event::{AT_STRING_LEN, SSID_FIELD_LEN},
    packet::MacAddress,
    DefaultRawMutex,
};

/// The default depth of the control message queue.
pub const COMMAND_QUEUE_DEPTH: usize = 10;
/// Longest Wi-Fi passphrase.
pub const PASSPHRASE_FIELD_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A non zero status code, that is reported to the host.
pub struct ControlError(pub u32);
impl ControlError {
    /// The station isn't associated with an access point.
    pub const NOT_CONNECTED: Self = Self(0x0413_0001);
    /// The request was too short.
    pub const INVALID_REQUEST: Self = Self(0x0413_0002);
}
pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Parameters of a connect request.
pub struct ConnectRequest {
    pub ssid: Vec<u8>,
    pub security: u32,
    pub passphrase: Vec<u8>,
    /// Only connect to this BSSID, if set.
    pub bssid: Option<MacAddress>,
    pub band: u8,
    /// Address, gateway and netmask.
    pub static_ip: Option<(Ipv4Addr, Ipv4Addr, Ipv4Addr)>,
}
impl ConnectRequest {
    pub const LEN: usize = 1 + SSID_FIELD_LEN + 4 + PASSPHRASE_FIELD_LEN + 6 + 1 + 12;

    pub fn parse(bytes: &[u8]) -> ControlResult<Self> {
        let bytes = bytes
            .get(..Self::LEN)
            .ok_or(ControlError::INVALID_REQUEST)?;
        let (ssid_len, rest) = bytes.split_at(1);
        let (ssid, rest) = rest.split_at(SSID_FIELD_LEN);
        let (security, rest) = rest.split_at(4);
        let (passphrase, rest) = rest.split_at(PASSPHRASE_FIELD_LEN);
        let (bssid, rest) = rest.split_at(6);
        let (band, rest) = rest.split_at(1);
        let address = |offset: usize| {
            Ipv4Addr::new(
                rest[offset],
                rest[offset + 1],
                rest[offset + 2],
                rest[offset + 3],
            )
        };
        let (address, gateway, netmask) = (address(0), address(4), address(8));

        let ssid_len = (ssid_len[0] as usize).min(SSID_FIELD_LEN - 1);
        let bssid: MacAddress = bssid.try_into().map_err(|_| ControlError::INVALID_REQUEST)?;
        Ok(Self {
            ssid: ssid[..ssid_len].to_vec(),
            security: u32::from_le_bytes(
                security
                    .try_into()
                    .map_err(|_| ControlError::INVALID_REQUEST)?,
            ),
            passphrase: until_nul(passphrase).to_vec(),
            bssid: (bssid != [0; 6]).then_some(bssid),
            band: band[0],
            static_ip: (!address.is_unspecified()
                && !gateway.is_unspecified()
                && !netmask.is_unspecified())
            .then_some((address, gateway, netmask)),
        })
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let len = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    &bytes[..len]
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// The access point, we're associated with.
pub struct ApInfo {
    pub ssid: Vec<u8>,
    pub security: u32,
    pub bssid: MacAddress,
    pub channel_width: u16,
    pub signal_strength: i16,
    pub channel: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpInfo {
    pub dhcp: bool,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub primary_dns: Ipv4Addr,
    pub secondary_dns: Ipv4Addr,
}
impl Default for IpInfo {
    fn default() -> Self {
        Self {
            dhcp: true,
            address: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            primary_dns: Ipv4Addr::UNSPECIFIED,
            secondary_dns: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// The Wi-Fi connection manager, that commands from the host are executed on.
#[allow(async_fn_in_trait)]
pub trait HostedControl {
    /// Whether the station is associated with an access point.
    fn is_connected(&self) -> bool;
    async fn mac_address(&mut self) -> ControlResult<MacAddress>;
    async fn ipv4_address(&mut self) -> ControlResult<Ipv4Addr>;
    async fn gateway_address(&mut self) -> ControlResult<Ipv4Addr>;
    async fn netmask(&mut self) -> ControlResult<Ipv4Addr>;
    async fn ap_info(&mut self) -> ControlResult<ApInfo>;
    async fn ip_info(&mut self) -> ControlResult<IpInfo>;
    /// Start a scan. Results are reported through scan events.
    async fn start_scan(&mut self) -> ControlResult<()>;
    /// Connect to an access point.
    ///
    /// The host was already told, that the request was accepted, so the result is only logged.
    async fn connect(&mut self, request: &ConnectRequest) -> ControlResult<()>;
    async fn disconnect(&mut self) -> ControlResult<()>;
    /// Ping the gateway and return the round trip time in milliseconds.
    async fn ping_gateway(&mut self) -> ControlResult<u32>;
    /// Handle a command, that isn't known to the bridge.
    ///
    /// Returns the response body, or [None] if no response should be sent.
    async fn user_command(
        &mut self,
        header: &BcdcHeader,
        body: &[u8],
    ) -> Option<ControlResult<Vec<u8>>> {
        let _ = body;
        warn!("Unsupported command {}.", header.command);
        None
    }
}

struct AtBuffer {
    bytes: [u8; AT_STRING_LEN],
    len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AtReadError {
    NoData,
    BufferTooSmall,
}

/// Holds one AT command from the host, until the application reads it.
pub struct AtCommandBuffer {
    inner: blocking_mutex::Mutex<DefaultRawMutex, RefCell<AtBuffer>>,
}
impl AtCommandBuffer {
    pub const fn new() -> Self {
        Self {
            inner: blocking_mutex::Mutex::new(RefCell::new(AtBuffer {
                bytes: [0; AT_STRING_LEN],
                len: 0,
            })),
        }
    }
    /// Whether a command is waiting to be read.
    pub fn is_data_ready(&self) -> bool {
        self.inner.lock(|buffer| buffer.borrow().len != 0)
    }
    /// Store a command, unless one is already pending.
    pub fn try_store(&self, command: &[u8]) -> bool {
        self.inner.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.len != 0 {
                return false;
            }
            let len = command.len().min(AT_STRING_LEN);
            buffer.bytes[..len].copy_from_slice(&command[..len]);
            buffer.len = len;
            true
        })
    }
    /// Move the pending command into `out` and return it's length.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, AtReadError> {
        self.inner.lock(|buffer| {
            let mut buffer = buffer.borrow_mut();
            let len = buffer.len;
            if len == 0 {
                return Err(AtReadError::NoData);
            }
            if out.len() < len {
                debug!("Buffer of {} bytes can't hold AT command of {} bytes.", out.len(), len);
                return Err(AtReadError::BufferTooSmall);
            }
            out[..len].copy_from_slice(&buffer.bytes[..len]);
            buffer.bytes = [0; AT_STRING_LEN];
            buffer.len = 0;
            Ok(len)
        })
    }
}
impl Default for AtCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandQueueFull;

/// Control messages waiting to be handled.
pub struct CommandQueue<const DEPTH: usize = COMMAND_QUEUE_DEPTH> {
    messages: channel::Channel<DefaultRawMutex, Vec<u8>, DEPTH>,
}
impl<const DEPTH: usize> CommandQueue<DEPTH> {
    pub const fn new() -> Self {
        Self {
            messages: channel::Channel::new(),
        }
    }
    /// Copy a message into the queue. This never blocks.
    pub fn try_enqueue(&self, message: &[u8]) -> Result<(), CommandQueueFull> {
        self.messages
            .try_send(message.to_vec())
            .map_err(|_| CommandQueueFull)
    }
    pub async fn receive(&self) -> Vec<u8> {
        self.messages.receive().await
    }
    pub fn len(&self) -> usize {
        self.messages.len()
    }
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
    pub fn clear(&self) {
        self.messages.clear();
    }
}
impl<const DEPTH: usize> Default for CommandQueue<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a response with `body` to `request`.
fn response(request: &BcdcHeader, status: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BCDC_HEADER_LEN + body.len());
    request.response(body.len(), status).write(&mut out);
    out.extend_from_slice(body);
    out
}

/// Serialize a response, filling the body with zeros on failure.
fn response_with<const N: usize>(
    request: &BcdcHeader,
    result: ControlResult<[u8; N]>,
) -> Vec<u8> {
    match result {
        Ok(body) => response(request, 0, &body),
        Err(ControlError(status)) => response(request, status, &[0; N]),
    }
}

fn require_connection<C: HostedControl>(control: &C) -> ControlResult<()> {
    if control.is_connected() {
        Ok(())
    } else {
        error!("Not connected to an access point.");
        Err(ControlError::NOT_CONNECTED)
    }
}

fn encode_ap_info(info: &ApInfo) -> [u8; 49] {
    let mut body = [0u8; 49];
    let ssid_len = info.ssid.len().min(SSID_FIELD_LEN - 1);
    body[0] = ssid_len as u8;
    body[1..][..ssid_len].copy_from_slice(&info.ssid[..ssid_len]);
    body[34..38].copy_from_slice(&info.security.to_le_bytes());
    body[38..44].copy_from_slice(&info.bssid);
    body[44..46].copy_from_slice(&info.channel_width.to_le_bytes());
    body[46..48].copy_from_slice(&info.signal_strength.to_le_bytes());
    body[48] = info.channel;
    body
}

fn encode_ip_info(info: &IpInfo) -> [u8; 21] {
    let mut body = [0u8; 21];
    body[0] = info.dhcp as u8;
    for (chunk, address) in body[1..].chunks_exact_mut(4).zip([
        info.address,
        info.netmask,
        info.gateway,
        info.primary_dns,
        info.secondary_dns,
    ]) {
        chunk.copy_from_slice(&address.octets());
    }
    body
}

/// Handle one control message.
///
/// `respond` is called with the serialized response, if there is one. Messages with a wrong
/// protocol version are rejected without a response.
pub async fn handle_command<C: HostedControl>(
    message: &[u8],
    control: &mut C,
    at_buffer: &AtCommandBuffer,
    mut respond: impl FnMut(Vec<u8>),
) -> Result<(), BcdcError> {
    let request = match BcdcHeader::parse(message) {
        Ok(request) => request,
        Err(err) => {
            error!("Rejected control message: {:?}", err);
            return Err(err);
        }
    };
    let body = &message[BCDC_HEADER_LEN..];
    let command = CommandId::from_bits(request.command);
    debug!(
        "Command {:?}, len {}, set {}.",
        command,
        request.len,
        request.flags.set()
    );

    if !request.flags.set() {
        let response = match command {
            CommandId::MacAddress => {
                // We answer with an error status instead of staying silent.
                response_with(&request, control.mac_address().await)
            }
            CommandId::Ipv4Address | CommandId::GatewayAddress | CommandId::Netmask => {
                let result = match require_connection(&*control) {
                    Ok(()) if command == CommandId::Ipv4Address => control.ipv4_address().await,
                    Ok(()) if command == CommandId::GatewayAddress => {
                        control.gateway_address().await
                    }
                    Ok(()) => control.netmask().await,
                    Err(err) => Err(err),
                };
                response_with(&request, result.map(|address| address.octets()))
            }
            CommandId::ApInfo => {
                let result = match require_connection(&*control) {
                    Ok(()) => control.ap_info().await,
                    Err(err) => Err(err),
                };
                response_with(&request, result.map(|info| encode_ap_info(&info)))
            }
            CommandId::IpInfo => {
                let result = match require_connection(&*control) {
                    Ok(()) => control.ip_info().await,
                    Err(err) => Err(err),
                };
                response_with(&request, result.map(|info| encode_ip_info(&info)))
            }
            _ => match control.user_command(&request, body).await {
                Some(result) => user_response(&request, result),
                None => return Ok(()),
            },
        };
        respond(response);
        return Ok(());
    }

    match command {
        CommandId::Scan => {
            let result = control.start_scan().await;
            match result {
                Ok(()) => info!("Scan started."),
                Err(err) => info!("Starting scan failed: {:?}", err),
            }
            respond(response_with(&request, result.map(|_| [])));
        }
        CommandId::Connect => {
            let connect = match ConnectRequest::parse(body) {
                Ok(connect) => connect,
                Err(err) => {
                    error!("Connect request of {} bytes is too short.", body.len());
                    respond(response(&request, err.0, &[]));
                    return Ok(());
                }
            };
            info!(
                "Connecting to SSID of length {}, security {:#x}, band {}.",
                connect.ssid.len(),
                connect.security,
                connect.band
            );
            // The host is told that the request was accepted before we start connecting.
            respond(response(&request, 0, &[]));
            match control.connect(&connect).await {
                Ok(()) => info!("Connected."),
                Err(err) => info!("Connecting failed: {:?}", err),
            }
        }
        CommandId::Disconnect => {
            let result = control.disconnect().await;
            if let Err(err) = result {
                info!("Disconnecting failed: {:?}", err);
            }
            respond(response_with(&request, result.map(|_| [])));
        }
        CommandId::Ping => {
            let result = match require_connection(&*control) {
                Ok(()) => control.ping_gateway().await,
                Err(err) => Err(err),
            };
            respond(response_with(&request, result.map(u32::to_le_bytes)));
        }
        CommandId::AtCommand => {
            let command = until_nul(&body[..body.len().min(AT_STRING_LEN)]);
            if !at_buffer.try_store(command) {
                error!("AT command dropped, the previous one wasn't read yet.");
                return Ok(());
            }
            respond(response(&request, 0, &[]));
        }
        _ => {
            if let Some(result) = control.user_command(&request, body).await {
                respond(user_response(&request, result));
            }
        }
    }
    Ok(())
}

fn user_response(request: &BcdcHeader, result: ControlResult<Vec<u8>>) -> Vec<u8> {
    match result {
        Ok(body) => response(request, 0, &body),
        Err(ControlError(status)) => response(request, status, &[]),
    }
}
