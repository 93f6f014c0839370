//! KNXnet/IP routing transport.
//!
//! Group telegrams travel as `ROUTING_INDICATION` frames over UDP. Topics are
//! three-level group addresses (`main/middle/sub`) and payloads are the
//! telegram's APDU (TPCI/APCI bytes followed by data). When the gateway
//! address is the routing multicast group the socket joins it; otherwise
//! frames are sent unicast to the gateway.
//!
//! ```text
//! 06 10 05 30 LL LL | 29 00 BC E0 SS SS DD DD NN | APDU...
//! KNXnet/IP header  | cEMI L_Data.ind
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use habitat_core::{KnxSettings, Listener, Subscribers, Unsubscribe};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{topic_matches, Transport, TransportError, TransportEvent};

/// KNXnet/IP routing multicast group.
pub const ROUTING_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

const HEADER_LEN: usize = 6;
const PROTOCOL_VERSION: u8 = 0x10;
const ROUTING_INDICATION: u16 = 0x0530;
const L_DATA_IND: u8 = 0x29;
/// Standard frame, no repeat, broadcast, low priority.
const CTRL1: u8 = 0xBC;
/// Group destination, hop count 6.
const CTRL2: u8 = 0xE0;
/// Individual address the bridge sends from (1.1.255).
const DEFAULT_SOURCE: u16 = 0x11FF;
const MAX_FRAME: usize = 512;

/// Parse a `main/middle/sub` group address.
pub fn parse_group_address(address: &str) -> Result<u16, TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());
    let parts: Vec<&str> = address.split('/').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }
    let main: u16 = parts[0].trim().parse().map_err(|_| invalid())?;
    let middle: u16 = parts[1].trim().parse().map_err(|_| invalid())?;
    let sub: u16 = parts[2].trim().parse().map_err(|_| invalid())?;
    if main > 31 || middle > 7 || sub > 255 {
        return Err(invalid());
    }
    Ok((main << 11) | (middle << 8) | sub)
}

pub fn format_group_address(raw: u16) -> String {
    format!("{}/{}/{}", raw >> 11, (raw >> 8) & 0x07, raw & 0xFF)
}

/// Wrap an APDU for `group` into a routing indication frame.
pub fn encode_frame(source: u16, group: u16, apdu: &[u8]) -> Vec<u8> {
    let total = HEADER_LEN + 9 + apdu.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[HEADER_LEN as u8, PROTOCOL_VERSION]);
    frame.extend_from_slice(&ROUTING_INDICATION.to_be_bytes());
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[L_DATA_IND, 0x00, CTRL1, CTRL2]);
    frame.extend_from_slice(&source.to_be_bytes());
    frame.extend_from_slice(&group.to_be_bytes());
    frame.push(apdu.len().saturating_sub(1) as u8);
    frame.extend_from_slice(apdu);
    frame
}

/// Extract `(group, apdu)` from a routing indication carrying a group
/// telegram. Anything else yields `None`.
pub fn decode_frame(frame: &[u8]) -> Option<(u16, Vec<u8>)> {
    if frame.len() < HEADER_LEN + 11 || frame[0] as usize != HEADER_LEN || frame[1] != PROTOCOL_VERSION {
        return None;
    }
    if u16::from_be_bytes([frame[2], frame[3]]) != ROUTING_INDICATION {
        return None;
    }
    let cemi = &frame[HEADER_LEN..];
    if cemi[0] != L_DATA_IND {
        return None;
    }
    let base = 2 + cemi[1] as usize;
    let ctrl2 = *cemi.get(base + 1)?;
    if ctrl2 & 0x80 == 0 {
        return None;
    }
    let group = u16::from_be_bytes([*cemi.get(base + 4)?, *cemi.get(base + 5)?]);
    let npdu_len = *cemi.get(base + 6)? as usize;
    let apdu = cemi.get(base + 7..base + 8 + npdu_len)?;
    Some((group, apdu.to_vec()))
}

pub struct KnxIpTransport {
    gateway_host: String,
    gateway_port: u16,
    source: u16,
    socket: Mutex<Option<(Arc<UdpSocket>, SocketAddr)>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    filters: Arc<Mutex<Vec<String>>>,
    listeners: Subscribers<TransportEvent>,
}

impl KnxIpTransport {
    pub fn new(settings: &KnxSettings) -> Self {
        Self {
            gateway_host: settings.gateway_host.clone(),
            gateway_port: settings.gateway_port,
            source: DEFAULT_SOURCE,
            socket: Mutex::new(None),
            receiver: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            filters: Arc::new(Mutex::new(Vec::new())),
            listeners: Subscribers::new("knx-transport"),
        }
    }

    async fn resolve_gateway(&self) -> Result<SocketAddr, TransportError> {
        let host = if self.gateway_host.is_empty() {
            ROUTING_MULTICAST.to_string()
        } else {
            self.gateway_host.clone()
        };
        let addr = tokio::net::lookup_host((host.as_str(), self.gateway_port))
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("{}: no address", host)));
        addr
    }

    fn stop_receiver(&self) {
        if let Some(task) = self.receiver.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for KnxIpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.stop_receiver();
        let gateway = self.resolve_gateway().await?;

        let socket = match gateway {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, v4.port()))
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                socket
                    .join_multicast_v4(*v4.ip(), Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                socket
            }
            _ => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?,
        };
        let socket = Arc::new(socket);

        let reader = socket.clone();
        let connected = self.connected.clone();
        let filters = self.filters.clone();
        let listeners = self.listeners.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_FRAME];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let Some((group, apdu)) = decode_frame(&buf[..len]) else {
                            debug!("Ignoring KNX frame from {}: {}", from, hex::encode(&buf[..len]));
                            continue;
                        };
                        let topic = format_group_address(group);
                        if filters.lock().iter().any(|f| topic_matches(f, &topic)) {
                            listeners.emit(&TransportEvent::Message { topic, payload: apdu });
                        }
                    }
                    Err(e) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!("KNX socket receive failed: {}", e);
                            listeners.emit(&TransportEvent::Disconnected(e.to_string()));
                        }
                        break;
                    }
                }
            }
        });

        *self.socket.lock() = Some((socket, gateway));
        *self.receiver.lock() = Some(task);
        self.connected.store(true, Ordering::SeqCst);
        info!("KNX routing transport ready, gateway {}", gateway);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_receiver();
        self.socket.lock().take();
        self.filters.lock().clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let group = parse_group_address(topic)?;
        let (socket, gateway) = self
            .socket
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let frame = encode_frame(self.source, group, &payload);
        debug!("KNX send to {}: {}", topic, hex::encode(&frame));
        socket
            .send_to(&frame, gateway)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut filters = self.filters.lock();
        if !filters.iter().any(|f| f == filter) {
            filters.push(filter.to_string());
        }
        Ok(())
    }

    fn on_event(&self, listener: Listener<TransportEvent>) -> Unsubscribe {
        self.listeners.register_listener(listener)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for KnxIpTransport {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_address_bounds() {
        assert_eq!(parse_group_address("1/2/3").unwrap(), 0x0A03);
        assert_eq!(parse_group_address("31/7/255").unwrap(), 0xFFFF);
        assert_eq!(format_group_address(0x0A03), "1/2/3");

        for bad in ["32/0/0", "0/8/0", "0/0/256", "1/2", "a/b/c", ""] {
            assert!(parse_group_address(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_frame_layout() {
        // GroupValueWrite "on" to 1/2/3
        let frame = encode_frame(0x11FF, 0x0A03, &[0x00, 0x81]);
        assert_eq!(hex::encode(&frame), "0610053000112900bce011ff0a03010081");
        assert_eq!(decode_frame(&frame), Some((0x0A03, vec![0x00, 0x81])));
    }

    #[test]
    fn test_decode_skips_additional_info() {
        // two bytes of additional info before the control fields
        let frame = [
            0x06, 0x10, 0x05, 0x30, 0x00, 0x15, 0x29, 0x02, 0xAA, 0xBB, 0xBC, 0xE0, 0x11, 0x01,
            0x0A, 0x03, 0x03, 0x00, 0x80, 0x0C, 0x1A,
        ];
        assert_eq!(decode_frame(&frame), Some((0x0A03, vec![0x00, 0x80, 0x0C, 0x1A])));
    }

    #[test]
    fn test_decode_rejects_other_services() {
        let mut frame = encode_frame(0x11FF, 0x0A03, &[0x00, 0x81]);
        frame[3] = 0x31;
        assert_eq!(decode_frame(&frame), None);
        assert_eq!(decode_frame(&[0x06, 0x10]), None);
    }
}
