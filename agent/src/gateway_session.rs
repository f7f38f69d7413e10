//! Wires `BleLink` <-> `HqvCodec` <-> `UdpEndpoint` with lifecycle and
//! cancellation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::BDAddr;
use hqv_protocol::command::Response;
use hqv_protocol::control_codec;
use hqv_protocol::hqv_codec::HqvCodec;
use hqv_protocol::session_state::{SessionState, StatusCode, Tri};
use log::{error, info, warn};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time;
use uuid::Uuid;

use crate::ble_link::{self, BleLink, DisconnectOutcome};
use crate::config::AddressKind;
use crate::udp_endpoint::UdpEndpoint;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inbound (BLE->UDP) header routing policy: `header == 3` (remote, DTLS)
/// forwards to UDP; any other value is logged and dropped.
const FORWARD_HEADER: u8 = 3;
/// Outbound (UDP->BLE) header is always remote+DTLS.
const OUTBOUND_HEADER: u8 = 3;
/// Opcode for the server-initiated "BT Disconnected" notification.
const OPCODE_BT_DISCONNECTED: u8 = 0x09;

pub struct GatewayConfig {
    pub mac: BDAddr,
    pub addr_type: AddressKind,
    pub adapter_name: Option<String>,
    pub write_uuid: Uuid,
    pub read_uuid: Uuid,
    pub mtu: u16,
    pub udp_dest: SocketAddr,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    /// The control channel's push sender, so an unsolicited BLE disconnect
    /// that exhausts reconnection can surface opcode `0x09` without the
    /// session needing a handle back into `ControlServer`.
    pub push: broadcast::Sender<Vec<u8>>,
}

/// A single live gateway session; exclusively owned by the `ControlServer`.
/// At most one instance is ever `running` at a time.
pub struct GatewaySession {
    shutdown: Arc<Notify>,
    /// Fired once by the shutdown monitor after it has actually disconnected
    /// BLE and cleared `gateway_running`, so [`Self::request_shutdown`] can
    /// block its caller until the session has truly stopped instead of just
    /// signaling and moving on.
    stopped: Arc<Notify>,
    ble: Arc<Mutex<BleLink>>,
}

impl GatewaySession {
    /// Starts the session: binds the UDP endpoint, starts the BLE link, and
    /// spawns the cooperating loops (BLE send, UDP send, shutdown monitor,
    /// unsolicited-disconnect watcher) plus the two cross-wiring tasks (BLE
    /// notify -> UDP send, UDP recv -> BLE write). Returns once BLE is
    /// ready; on BLE start failure, `session_state` transitions to `Error`
    /// and the session is never marked running.
    pub async fn start(
        config: GatewayConfig,
        session_state: Arc<SessionState>,
    ) -> hqv_protocol::Result<Self> {
        let adapter = ble_link::get_adapter(config.adapter_name.as_deref()).await?;
        let (mut ble, mut ble_notify_rx, mut ble_unsolicited_rx) = BleLink::new(
            adapter,
            config.mac,
            config.write_uuid,
            config.read_uuid,
            config.auto_reconnect,
            config.connect_timeout,
        )
        .await;

        if let Err(e) = ble.start().await {
            session_state.set_status(StatusCode::Error).await;
            return Err(e);
        }

        let mut udp = UdpEndpoint::bind(config.udp_dest).await?;
        let udp_sender = udp.sender();
        let udp_send_rx = udp.take_send_queue();
        let udp = Arc::new(udp);
        let ble_writer = ble.write_queue();
        let mtu = config.mtu;
        let mac_bytes: [u8; 6] = config.mac.into_inner();
        let push = config.push;

        let shutdown = Arc::new(Notify::new());

        let (send_rx, send_active) = ble
            .take_send_loop_parts()
            .expect("ble is ready immediately after a successful start()");
        tokio::spawn(BleLink::drive_send_loop(send_rx, send_active));

        let ble = Arc::new(Mutex::new(ble));

        // BLE notify -> HqvCodec.ingest -> UDP send
        tokio::spawn(async move {
            let mut codec = HqvCodec::new();
            while let Some(fragment) = ble_notify_rx.recv().await {
                for msg in codec.ingest(&fragment) {
                    if msg.header == FORWARD_HEADER {
                        if udp_sender.send(msg.payload).await.is_err() {
                            break;
                        }
                    } else {
                        warn!("gateway_session: dropping inbound frame with header {:#04x}", msg.header);
                    }
                }
            }
        });

        // Drains queued outbound datagrams to the socket with bounded retry.
        let send_udp = udp.clone();
        tokio::spawn(async move {
            send_udp.run_send_loop(udp_send_rx).await;
        });

        // UDP recv -> HqvCodec.wrap(header=3) -> BLE write
        let udp_dest = config.udp_dest;
        let recv_udp = udp.clone();
        tokio::spawn(async move {
            let result = recv_udp
                .run_recv_loop(|datagram| {
                    match HqvCodec::wrap(&datagram, OUTBOUND_HEADER, mtu) {
                        Ok(fragments) => {
                            for f in fragments {
                                let _ = ble_writer.try_send(Some(f));
                            }
                        }
                        Err(e) => warn!("gateway_session: failed to wrap outbound datagram: {e}"),
                    }
                })
                .await;
            if let Err(e) = result {
                warn!("gateway_session: udp recv loop ended: {e} (dest {udp_dest})");
            }
        });

        // Unsolicited BLE disconnect: update status, clear device data, and
        // either recover via the bounded reconnect loop or escalate to a
        // terminal Error with a BtDisconnected notification.
        let unsolicited_state = session_state.clone();
        let unsolicited_ble = ble.clone();
        let unsolicited_push = push.clone();
        let unsolicited_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if ble_unsolicited_rx.recv().await.is_none() {
                return;
            }
            warn!("gateway_session: unsolicited BLE disconnect");

            let was_leshan_registered = matches!(unsolicited_state.device_leshan_status(), Tri::True);
            unsolicited_state
                .set_status(if was_leshan_registered {
                    StatusCode::ConnectionLostLeshanError
                } else {
                    StatusCode::ConnectionLost
                })
                .await;
            unsolicited_state.clear_device_data().await;

            let auto_reconnect = unsolicited_ble.lock().await.auto_reconnect();
            let reconnected = if auto_reconnect {
                unsolicited_ble.lock().await.reconnect_loop().await.is_ok()
            } else {
                false
            };

            if reconnected {
                info!("gateway_session: reconnected after unsolicited disconnect");
                unsolicited_state.set_status(StatusCode::Connected).await;
                return;
            }

            error!("gateway_session: reconnect exhausted or disabled, session terminating");
            unsolicited_state.set_status(StatusCode::Error).await;
            unsolicited_state.set_gateway_running(false).await;
            let framed = control_codec::encode(
                &Response::ack(OPCODE_BT_DISCONNECTED, mac_bytes.to_vec()).to_bytes(),
            );
            let _ = unsolicited_push.send(framed);
            unsolicited_shutdown.notify_waiters();
        });

        let stopped = Arc::new(Notify::new());
        let monitor_shutdown = shutdown.clone();
        let monitor_stopped = stopped.clone();
        let monitor_state = session_state.clone();
        let monitor_ble = ble.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor_shutdown.notified() => break,
                    _ = time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
                }
            }
            let outcome = monitor_ble.lock().await.stop().await;
            monitor_state
                .set_status(match outcome {
                    DisconnectOutcome::Graceful => StatusCode::GracefullyDisconnected,
                    DisconnectOutcome::Unsafe => StatusCode::Disconnected,
                })
                .await;
            monitor_state.set_gateway_running(false).await;
            info!("gateway_session: shutdown monitor finished, disconnect was {outcome:?}");
            monitor_stopped.notify_one();
        });

        session_state.set_gateway_running(true).await;
        session_state.set_status(StatusCode::Connected).await;

        Ok(GatewaySession { shutdown, stopped, ble })
    }

    /// Signals the shutdown event, queues the write-loop sentinel so the BLE
    /// send loop drains before disconnect, and then blocks until the
    /// shutdown monitor has actually disconnected BLE — mirroring the
    /// original's `gateway_stop.set(); currentThread_Gateway.join()` pairing,
    /// so a caller that replaces this session with a new one never runs two
    /// live BLE links at once. Idempotent.
    pub async fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
        let _ = self.ble.lock().await.write_queue().send(None).await;
        self.stopped.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_poll_interval_is_half_a_second() {
        assert_eq!(SHUTDOWN_POLL_INTERVAL, Duration::from_millis(500));
    }
}
