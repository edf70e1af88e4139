//! BACnet/IP transport endpoint

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::{DeviceInfo, ObjectDescriptor, ObjectServer, ProtocolError};
use crate::config::BindAddress;
use crate::point::PointIdentifier;

// ─────────────────────────────────────────────────────────────────────────────
// BVLL framing
// ─────────────────────────────────────────────────────────────────────────────

/// BVLL type octet for BACnet/IP
pub const BVLL_TYPE_BIP: u8 = 0x81;

pub const BVLC_RESULT: u8 = 0x00;
pub const BVLC_REGISTER_FOREIGN_DEVICE: u8 = 0x05;

/// BVLC-Result code for a successful operation
pub const RESULT_SUCCESSFUL: u16 = 0x0000;
/// BVLC-Result code for a rejected Register-Foreign-Device
pub const RESULT_REGISTER_FOREIGN_DEVICE_NAK: u16 = 0x0030;

const MAX_DATAGRAM: usize = 1500;

/// Encode a Register-Foreign-Device request
pub fn encode_register_foreign_device(ttl: u16) -> [u8; 6] {
    let [hi, lo] = ttl.to_be_bytes();
    [BVLL_TYPE_BIP, BVLC_REGISTER_FOREIGN_DEVICE, 0x00, 0x06, hi, lo]
}

/// Split a BVLL frame into its function and payload
fn decode_bvll(frame: &[u8]) -> Option<(u8, &[u8])> {
    if frame.len() < 4 || frame[0] != BVLL_TYPE_BIP {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    if length < 4 || length > frame.len() {
        return None;
    }
    Some((frame[1], &frame[4..length]))
}

/// State of the foreign device registration with a BBMD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No BBMD configured
    None,
    /// Request sent, no answer yet
    Pending,
    Registered,
    /// The BBMD answered with a non-zero result code
    Rejected(u16),
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

pub struct BipServer {
    socket: Arc<UdpSocket>,
    local: BindAddress,
    broadcast: Mutex<SocketAddr>,
    device: Mutex<Option<DeviceInfo>>,
    objects: Mutex<BTreeMap<PointIdentifier, ObjectDescriptor>>,
    bbmd: Mutex<Option<SocketAddr>>,
    registration: Mutex<Registration>,
}

impl BipServer {
    /// Bind the UDP transport
    pub async fn bind(local: BindAddress) -> Result<Self, ProtocolError> {
        let addr = local.socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ProtocolError::Bind { addr, source })?;
        socket.set_broadcast(true)?;

        // Port 0 binds an ephemeral port; report the real one.
        let port = socket.local_addr()?.port();
        let local = BindAddress { port, ..local };
        let broadcast = SocketAddr::V4(SocketAddrV4::new(local.broadcast(), local.port));

        info!("BACnet/IP transport bound on {} (broadcast {})", local, broadcast);

        Ok(Self {
            socket: Arc::new(socket),
            local,
            broadcast: Mutex::new(broadcast),
            device: Mutex::new(None),
            objects: Mutex::new(BTreeMap::new()),
            bbmd: Mutex::new(None),
            registration: Mutex::new(Registration::None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .unwrap_or_else(|_| self.local.socket_addr())
    }

    pub fn bind_address(&self) -> BindAddress {
        self.local
    }

    pub fn broadcast_address(&self) -> SocketAddr {
        *self.broadcast.lock()
    }

    /// Replace the derived broadcast address. The port follows the bind port.
    pub fn set_broadcast_override(&self, value: &str) -> Result<SocketAddr, ProtocolError> {
        let ip: Ipv4Addr = value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::Broadcast(value.to_string()))?;
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, self.local.port));
        *self.broadcast.lock() = addr;
        info!("Broadcast address overridden to {}", addr);
        Ok(addr)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device.lock().clone()
    }

    pub fn object(&self, id: &PointIdentifier) -> Option<ObjectDescriptor> {
        self.objects.lock().get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn registration(&self) -> Registration {
        *self.registration.lock()
    }

    /// Send Register-Foreign-Device to a BBMD.
    ///
    /// The answer arrives asynchronously on the receive loop, which updates
    /// [`BipServer::registration`].
    pub async fn register_foreign_device(
        &self,
        bbmd: SocketAddr,
        ttl: u16,
    ) -> Result<(), ProtocolError> {
        *self.bbmd.lock() = Some(bbmd);
        *self.registration.lock() = Registration::Pending;

        let frame = encode_register_foreign_device(ttl);
        self.socket
            .send_to(&frame, bbmd)
            .await
            .map_err(|e| ProtocolError::ForeignDevice(format!("send to {bbmd}: {e}")))?;

        debug!("Sent Register-Foreign-Device to {} (ttl {}s)", bbmd, ttl);
        Ok(())
    }

    /// Receive datagrams until the socket fails
    pub async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(e) => {
                    warn!("BACnet/IP receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_datagram(&self, frame: &[u8], from: SocketAddr) {
        let Some((function, payload)) = decode_bvll(frame) else {
            trace!("Ignoring non-BVLL datagram from {}", from);
            return;
        };

        match function {
            BVLC_RESULT if Some(from) == *self.bbmd.lock() => {
                let code = match payload {
                    [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                    _ => {
                        warn!("Truncated BVLC-Result from {}", from);
                        return;
                    }
                };
                self.apply_registration_result(from, code);
            }
            other => trace!("BVLL function 0x{:02x} from {} ({} bytes)", other, from, payload.len()),
        }
    }

    fn apply_registration_result(&self, from: SocketAddr, code: u16) {
        let mut registration = self.registration.lock();
        if code == RESULT_SUCCESSFUL {
            if *registration != Registration::Registered {
                info!("Registered as foreign device with {}", from);
            }
            *registration = Registration::Registered;
        } else {
            warn!(
                "Foreign device registration with {} rejected (result 0x{:04x})",
                from, code
            );
            *registration = Registration::Rejected(code);
        }
    }
}

impl ObjectServer for BipServer {
    fn set_device_info(&self, info: DeviceInfo) {
        info!(
            "Device {} '{}' version {}",
            info.object_identifier, info.object_name, info.application_software_version
        );
        *self.device.lock() = Some(info);
    }

    fn add_object(&self, object: ObjectDescriptor) -> Result<(), ProtocolError> {
        let mut objects = self.objects.lock();
        let id = object.object_identifier;
        let is_device = self
            .device
            .lock()
            .as_ref()
            .is_some_and(|d| d.object_identifier == id);
        if is_device || objects.contains_key(&id) {
            return Err(ProtocolError::Registration(id));
        }
        debug!("Registered object {} '{}'", id, object.object_name);
        objects.insert(id, object);
        Ok(())
    }
}
