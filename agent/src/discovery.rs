//! UDP broadcast peer-discovery announcer/listener, and the BLE HAPP scan
//! used to populate `last_scan`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use chrono::Utc;
use futures_util::StreamExt;
use hqv_protocol::session_state::{Peer, ScanEntry, SessionState};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time;
use uuid::Uuid;

use crate::ble_link;

const DISCOVERY_PORT: u16 = 5385;
const BROADCAST_ADDR: &str = "255.255.255.255";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);
const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Peers not re-announced within 3x the announce interval are evicted (see
/// DESIGN.md for the rationale).
const PEER_TTL_SECONDS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    message: String,
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(rename = "messageTypeVersion")]
    message_type_version: String,
    #[serde(rename = "guiAccess")]
    gui_access: bool,
    #[serde(rename = "customName")]
    custom_name: String,
    endpoint: String,
    ip: String,
    port: u16,
    version: String,
}

const MESSAGE_TYPE: &str = "SBLETSDISCPKG";
const MESSAGE_TYPE_VERSION: &str = "1";
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct DiscoveryService {
    session_state: Arc<SessionState>,
    custom_name: String,
    gui_access: bool,
    webserver_port: u16,
}

impl DiscoveryService {
    pub fn new(
        session_state: Arc<SessionState>,
        custom_name: String,
        gui_access: bool,
        webserver_port: u16,
    ) -> Self {
        DiscoveryService {
            session_state,
            custom_name,
            gui_access,
            webserver_port,
        }
    }

    /// Runs the announce loop and the listener loop concurrently until the
    /// process exits.
    pub async fn run(self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
        socket.set_broadcast(true)?;
        let local_ip = local_ipv4().unwrap_or_else(|| "127.0.0.1".to_string());

        let announce = self.run_announce_loop(&socket, &local_ip);
        let listen = self.run_listen_loop(&socket, &local_ip);
        tokio::try_join!(announce, listen)?;
        Ok(())
    }

    async fn run_announce_loop(&self, socket: &UdpSocket, local_ip: &str) -> anyhow::Result<()> {
        let dest: SocketAddr = format!("{BROADCAST_ADDR}:{DISCOVERY_PORT}").parse().unwrap();
        loop {
            let announcement = Announcement {
                message: "discover".into(),
                message_type: MESSAGE_TYPE.into(),
                message_type_version: MESSAGE_TYPE_VERSION.into(),
                gui_access: self.gui_access,
                custom_name: self.custom_name.clone(),
                endpoint: self.session_state.session_uuid(),
                ip: local_ip.to_string(),
                port: self.webserver_port,
                version: AGENT_VERSION.into(),
            };
            if let Ok(payload) = serde_json::to_vec(&announcement) {
                if let Err(e) = socket.send_to(&payload, dest).await {
                    warn!("discovery: announce send failed: {e}");
                }
            }
            time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    async fn run_listen_loop(&self, socket: &UdpSocket, local_ip: &str) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            match time::timeout(LISTEN_POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) => {
                    if src.ip().to_string() == local_ip {
                        continue;
                    }
                    match serde_json::from_slice::<Announcement>(&buf[..len]) {
                        Ok(announcement) if announcement.message_type == MESSAGE_TYPE => {
                            let peer = Peer {
                                custom_name: announcement.custom_name,
                                gui_access: announcement.gui_access,
                                endpoint: announcement.endpoint,
                                ip: announcement.ip,
                                port: announcement.port,
                                version: announcement.version,
                                last_seen: Utc::now().timestamp(),
                            };
                            self.session_state.upsert_peer(peer).await;
                            self.session_state
                                .evict_stale_peers(Utc::now().timestamp(), PEER_TTL_SECONDS);
                        }
                        Ok(_) => debug!("discovery: ignoring announcement with unexpected messageType"),
                        Err(_) => {} // non-JSON datagram on the discovery port, ignore
                    }
                }
                Ok(Err(e)) => warn!("discovery: recv error: {e}"),
                Err(_) => {} // poll timeout, loop back to check announce cadence
            }
        }
    }
}

fn local_ipv4() -> Option<String> {
    // A connected UDP socket never sends a packet for an unreachable address
    // lookup; it only asks the kernel to pick the outbound interface.
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:80").ok()?;
    match probe.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip.to_string()),
        IpAddr::V6(_) => None,
    }
}

/// Scans for `timeout` and reports every discovered peripheral advertising
/// either the write or the notify HQV GATT characteristic's service, for
/// `ScanHappDevices` (opcode `0x10`).
pub async fn scan_happ_devices(
    adapter_name: Option<&str>,
    timeout: Duration,
    write_uuid: Uuid,
    read_uuid: Uuid,
) -> hqv_protocol::Result<Vec<ScanEntry>> {
    let adapter = ble_link::get_adapter(adapter_name).await?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| hqv_protocol::AgentError::Transport(std::io::Error::other(e)))?;

    let mut events = adapter
        .events()
        .await
        .map_err(|e| hqv_protocol::AgentError::Transport(std::io::Error::other(e)))?;

    let mut entries = Vec::new();
    let deadline = time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match time::timeout(remaining, events.next()).await {
            Ok(Some(_event)) => {
                // Property snapshot, not the event payload itself: pulling
                // fresh state per event keeps rssi/services current.
                for peripheral in adapter.peripherals().await.unwrap_or_default() {
                    let Ok(Some(props)) = peripheral.properties().await else { continue };
                    let write_capable = props.services.contains(&write_uuid);
                    let notify_capable = props.services.contains(&read_uuid);
                    if !write_capable && !notify_capable {
                        continue;
                    }
                    let mac = props.address.into_inner();
                    if entries.iter().any(|e: &ScanEntry| e.mac == mac) {
                        continue;
                    }
                    // The HAPP endpoint identity is the first advertised
                    // service UUID, not the advertised local name.
                    let Some(endpoint_uuid) = props.services.first() else {
                        continue;
                    };
                    entries.push(ScanEntry {
                        mac,
                        endpoint_uuid: endpoint_uuid.simple().to_string(),
                        notify_capable,
                        write_capable,
                        rssi: props.rssi.unwrap_or_default(),
                        alias: None,
                    });
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    adapter.stop_scan().await.ok();
    Ok(entries)
}

/// Live, single-target scan used by `ConnectBle` (opcode `0x07`) when `mac`
/// isn't already in `lastHAPPScan`: no precondition on a prior `0x10` scan,
/// unlike `StartGateway`. Returns as soon as `target` is seen, or `None` once
/// `timeout` elapses without a match.
pub async fn scan_by_address(
    adapter_name: Option<&str>,
    timeout: Duration,
    target: [u8; 6],
    write_uuid: Uuid,
    read_uuid: Uuid,
) -> hqv_protocol::Result<Option<ScanEntry>> {
    let adapter = ble_link::get_adapter(adapter_name).await?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| hqv_protocol::AgentError::Transport(std::io::Error::other(e)))?;

    let mut events = adapter
        .events()
        .await
        .map_err(|e| hqv_protocol::AgentError::Transport(std::io::Error::other(e)))?;

    let deadline = time::Instant::now() + timeout;
    let found = 'outer: loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            break None;
        }
        match time::timeout(remaining, events.next()).await {
            Ok(Some(CentralEvent::DeviceDiscovered(_)) | Some(CentralEvent::DeviceUpdated(_))) => {
                for peripheral in adapter.peripherals().await.unwrap_or_default() {
                    let Ok(Some(props)) = peripheral.properties().await else { continue };
                    if props.address.into_inner() != target {
                        continue;
                    }
                    let write_capable = props.services.contains(&write_uuid);
                    let notify_capable = props.services.contains(&read_uuid);
                    let Some(endpoint_uuid) = props.services.first() else {
                        continue;
                    };
                    break 'outer Some(ScanEntry {
                        mac: target,
                        endpoint_uuid: endpoint_uuid.simple().to_string(),
                        notify_capable,
                        write_capable,
                        rssi: props.rssi.unwrap_or_default(),
                        alias: None,
                    });
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break None,
            Err(_) => break None,
        }
    };
    adapter.stop_scan().await.ok();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trips_through_json() {
        let announcement = Announcement {
            message: "discover".into(),
            message_type: MESSAGE_TYPE.into(),
            message_type_version: MESSAGE_TYPE_VERSION.into(),
            gui_access: true,
            custom_name: "hqv-agent".into(),
            endpoint: "abc123".into(),
            ip: "10.0.0.5".into(),
            port: 8080,
            version: "0.1.0".into(),
        };
        let json = serde_json::to_string(&announcement).unwrap();
        let parsed: Announcement = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_type, MESSAGE_TYPE);
        assert_eq!(parsed.endpoint, "abc123");
    }
}
