//! The process-wide session record: all access goes through accessors on a
//! guarded struct, and every mutation publishes a snapshot to subscribers via
//! [`crate::event::EventManager`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

use crate::event::EventManager;

pub type Mac = [u8; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Disconnected = 0,
    Connected = 1,
    GracefullyDisconnected = 2,
    Error = 4,
    ConnectionLost = 5,
    ConnectionLostLeshanError = 6,
    Initial = 7,
}

/// Tri-state status of the device's LwM2M registration with Leshan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tri {
    True,
    False,
    Retrieving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub mac: Mac,
    pub endpoint_uuid: String,
    pub notify_capable: bool,
    pub write_capable: bool,
    pub rssi: i16,
    pub alias: Option<String>,
}

/// A discovered peer agent. `last_seen` is refreshed on every
/// announcement but deliberately excluded from the identity tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub custom_name: String,
    pub gui_access: bool,
    pub endpoint: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    pub last_seen: i64,
}

impl Peer {
    fn identity(&self) -> (&str, &str, u16, &str, &str, bool) {
        (
            &self.endpoint,
            &self.ip,
            self.port,
            &self.version,
            &self.custom_name,
            self.gui_access,
        )
    }
}

/// A snapshot published to subscribers after any mutating accessor runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub connected_mac: Option<Mac>,
    pub connected_hid: Option<String>,
    pub connected_alias: Option<String>,
    pub connected_iprid: Option<Uuid>,
    pub session_uuid: String,
    pub connect_status: StatusCode,
    pub gateway_running: bool,
    pub device_leshan_status: Tri,
}

struct Inner {
    connected_mac: Option<Mac>,
    connected_hid: Option<String>,
    connected_alias: Option<String>,
    connected_iprid: Option<Uuid>,
    session_uuid: String,
    startup_uuid: String,
    connect_status: StatusCode,
    gateway_running: bool,
    device_leshan_status: Tri,
    last_scan: Option<Vec<ScanEntry>>,
    discovered_peers: Vec<Peer>,
}

/// Process-wide, guarded session record with change-notification observers.
/// Lifecycle is tied to process start/exit: construct once in `main`, share
/// via `Arc`.
pub struct SessionState {
    inner: Mutex<Inner>,
    events: EventManager<SessionEvent>,
}

impl SessionState {
    /// Creates a fresh state with a new `startup_uuid` that also seeds
    /// `session_uuid`.
    pub fn new() -> Arc<Self> {
        let startup_uuid = short_token();
        Arc::new(SessionState {
            inner: Mutex::new(Inner {
                connected_mac: None,
                connected_hid: None,
                connected_alias: None,
                connected_iprid: None,
                session_uuid: startup_uuid.clone(),
                startup_uuid,
                connect_status: StatusCode::Initial,
                gateway_running: false,
                device_leshan_status: Tri::False,
                last_scan: None,
                discovered_peers: Vec::new(),
            }),
            events: EventManager::new(),
        })
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.events.create_receiver()
    }

    async fn notify(&self) {
        let snapshot = {
            let g = self.inner.lock().unwrap();
            SessionEvent {
                connected_mac: g.connected_mac,
                connected_hid: g.connected_hid.clone(),
                connected_alias: g.connected_alias.clone(),
                connected_iprid: g.connected_iprid,
                session_uuid: g.session_uuid.clone(),
                connect_status: g.connect_status,
                gateway_running: g.gateway_running,
                device_leshan_status: g.device_leshan_status,
            }
        };
        self.events.publish(snapshot).await;
    }

    pub fn session_uuid(&self) -> String {
        self.inner.lock().unwrap().session_uuid.clone()
    }

    pub fn startup_uuid(&self) -> String {
        self.inner.lock().unwrap().startup_uuid.clone()
    }

    pub fn status(&self) -> StatusCode {
        self.inner.lock().unwrap().connect_status
    }

    pub fn gateway_running(&self) -> bool {
        self.inner.lock().unwrap().gateway_running
    }

    pub fn connected_mac(&self) -> Option<Mac> {
        self.inner.lock().unwrap().connected_mac
    }

    pub fn connected_hid(&self) -> Option<String> {
        self.inner.lock().unwrap().connected_hid.clone()
    }

    pub fn connected_alias(&self) -> Option<String> {
        self.inner.lock().unwrap().connected_alias.clone()
    }

    pub fn connected_iprid(&self) -> Option<Uuid> {
        self.inner.lock().unwrap().connected_iprid
    }

    pub fn device_leshan_status(&self) -> Tri {
        self.inner.lock().unwrap().device_leshan_status
    }

    pub async fn set_status(&self, status: StatusCode) {
        self.inner.lock().unwrap().connect_status = status;
        self.notify().await;
    }

    pub async fn set_gateway_running(&self, running: bool) {
        self.inner.lock().unwrap().gateway_running = running;
        self.notify().await;
    }

    pub async fn set_device_leshan_status(&self, status: Tri) {
        self.inner.lock().unwrap().device_leshan_status = status;
        self.notify().await;
    }

    pub async fn set_connected_hid(&self, hid: String) {
        self.inner.lock().unwrap().connected_hid = Some(hid);
        self.notify().await;
    }

    pub async fn set_alias(&self, alias: String) {
        self.inner.lock().unwrap().connected_alias = Some(alias);
        self.notify().await;
    }

    pub async fn set_last_scan(&self, scan: Vec<ScanEntry>) {
        self.inner.lock().unwrap().last_scan = Some(scan);
        self.notify().await;
    }

    pub fn last_scan(&self) -> Option<Vec<ScanEntry>> {
        self.inner.lock().unwrap().last_scan.clone()
    }

    /// Adopts a BLE device: replaces `session_uuid` with the device's
    /// 16-octet endpoint UUID and records its MAC.
    pub async fn adopt_device(&self, mac: Mac, endpoint_uuid: Uuid) {
        {
            let mut g = self.inner.lock().unwrap();
            g.connected_mac = Some(mac);
            g.connected_iprid = Some(endpoint_uuid);
            g.session_uuid = endpoint_uuid.simple().to_string();
        }
        self.notify().await;
    }

    /// Clears device identifiers and restores `session_uuid` to
    /// `startup_uuid`, per the invariant `session_uuid == startup_uuid`
    /// whenever `connected_mac is None`.
    pub async fn clear_device_data(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            g.connected_mac = None;
            g.connected_hid = None;
            g.connected_alias = None;
            g.connected_iprid = None;
            g.session_uuid = g.startup_uuid.clone();
            g.device_leshan_status = Tri::False;
        }
        self.notify().await;
    }

    /// Inserts or refreshes a discovered peer, keyed by identity excluding
    /// `last_seen`.
    pub async fn upsert_peer(&self, peer: Peer) {
        {
            let mut g = self.inner.lock().unwrap();
            if let Some(existing) = g
                .discovered_peers
                .iter_mut()
                .find(|p| p.identity() == peer.identity())
            {
                existing.last_seen = peer.last_seen;
            } else {
                g.discovered_peers.push(peer);
            }
        }
        self.notify().await;
    }

    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().discovered_peers.clone()
    }

    /// Evicts peers whose `last_seen` is older than `now - ttl_seconds` (see
    /// DESIGN.md for the chosen TTL).
    pub fn evict_stale_peers(&self, now: i64, ttl_seconds: i64) {
        let mut g = self.inner.lock().unwrap();
        g.discovered_peers
            .retain(|p| now - p.last_seen <= ttl_seconds);
    }
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_uuid_equals_startup_uuid_until_adopted() {
        let state = SessionState::new();
        assert_eq!(state.session_uuid(), state.startup_uuid());

        let endpoint = Uuid::new_v4();
        state.adopt_device([1, 2, 3, 4, 5, 6], endpoint).await;
        assert_ne!(state.session_uuid(), state.startup_uuid());
        assert_eq!(state.connected_mac(), Some([1, 2, 3, 4, 5, 6]));

        state.clear_device_data().await;
        assert_eq!(state.session_uuid(), state.startup_uuid());
        assert_eq!(state.connected_mac(), None);
    }

    #[tokio::test]
    async fn upsert_peer_dedups_by_identity_ignoring_last_seen() {
        let state = SessionState::new();
        let peer = Peer {
            custom_name: "box".into(),
            gui_access: true,
            endpoint: "ep-1".into(),
            ip: "10.0.0.5".into(),
            port: 8080,
            version: "1".into(),
            last_seen: 1,
        };
        state.upsert_peer(peer.clone()).await;
        let mut updated = peer.clone();
        updated.last_seen = 2;
        state.upsert_peer(updated).await;

        let peers = state.discovered_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].last_seen, 2);
    }

    #[tokio::test]
    async fn subscribers_observe_status_changes() {
        let state = SessionState::new();
        let mut rx = state.subscribe();
        state.set_status(StatusCode::Connected).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.connect_status, StatusCode::Connected);
    }
}
