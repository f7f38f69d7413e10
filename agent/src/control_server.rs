//! Length-framed TCP (+ WebSocket bridge) command dispatcher.
//!
//! Grounded in the bridge handler's dispatcher/channel pattern
//! (`bluetooth/handlers/bridge.rs`): a single dispatch point routes decoded
//! messages to the right handler and pushes unsolicited, server-initiated
//! messages back out through the same framed transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::BDAddr;
use futures_util::{SinkExt, StreamExt};
use hqv_protocol::command::{Command, ErrorCode, Opcode, Response};
use hqv_protocol::control_codec::{self, Decoder};
use hqv_protocol::leshan::LeshanClient;
use hqv_protocol::session_state::{SessionState, StatusCode};
use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::discovery;
use crate::gateway_session::{GatewayConfig, GatewaySession};
use crate::stores::Store;

const LESHAN_POLL_ATTEMPTS: u32 = 10;
const LESHAN_POLL_INTERVAL: Duration = Duration::from_secs(3);
const LESHAN_REGULAR_POLL_INTERVAL: Duration = Duration::from_secs(300);
const HAPP_SCAN_RETRIES: u32 = 4;
const HAPP_SCAN_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Shared context every connection handler and background task dispatches
/// against. One instance per process, built once in `main`.
pub struct ServerCtx {
    pub config: Config,
    pub session_state: Arc<SessionState>,
    pub aliases: Arc<Store>,
    pub psks: Arc<Store>,
    gateway: Mutex<Option<GatewaySession>>,
    attached: AtomicBool,
    push: broadcast::Sender<Vec<u8>>,
}

impl ServerCtx {
    pub fn new(config: Config, session_state: Arc<SessionState>, aliases: Store, psks: Store) -> Arc<Self> {
        let (push, _) = broadcast::channel(32);
        Arc::new(ServerCtx {
            config,
            session_state,
            aliases: Arc::new(aliases),
            psks: Arc::new(psks),
            gateway: Mutex::new(None),
            attached: AtomicBool::new(false),
            push,
        })
    }
}

/// Runs the TCP listener and the WebSocket bridge concurrently until either
/// task returns (process shutdown).
pub async fn run(ctx: Arc<ServerCtx>) -> anyhow::Result<()> {
    let tcp_port = ctx.config.control_port;
    let ws_port = ctx.config.ws_port;

    let tcp = run_tcp_listener(ctx.clone(), tcp_port);
    let ws = run_ws_bridge(ctx.clone(), ws_port, tcp_port);

    tokio::try_join!(tcp, ws)?;
    Ok(())
}

/// Single-client model: while a connection is active, subsequent accepted
/// sockets are closed immediately rather than queued.
async fn run_tcp_listener(ctx: Arc<ServerCtx>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("control_server: listening on 0.0.0.0:{port}");
    let busy = Arc::new(AtomicBool::new(false));

    loop {
        let (socket, peer) = listener.accept().await?;
        if busy.swap(true, Ordering::SeqCst) {
            warn!("control_server: rejecting {peer}, a client is already connected");
            busy.store(true, Ordering::SeqCst);
            continue;
        }
        let ctx = ctx.clone();
        let busy = busy.clone();
        tokio::spawn(async move {
            info!("control_server: client {peer} connected");
            if let Err(e) = handle_connection(socket, ctx.clone()).await {
                warn!("control_server: connection {peer} ended: {e}");
            }
            ctx.attached.store(false, Ordering::SeqCst);
            busy.store(false, Ordering::SeqCst);
        });
    }
}

async fn handle_connection(mut socket: TcpStream, ctx: Arc<ServerCtx>) -> anyhow::Result<()> {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];
    let mut push_rx = ctx.push.subscribe();

    loop {
        tokio::select! {
            read = socket.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                for frame in decoder.push(&buf[..n]) {
                    let Some(cmd) = Command::from_frame(&frame) else { continue };
                    let response = dispatch(cmd, &ctx).await;
                    socket.write_all(&control_codec::encode(&response.to_bytes())).await?;
                }

            }
            pushed = push_rx.recv() => {
                match pushed {
                    Ok(framed) => socket.write_all(&framed).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Each WS message is treated as an already control-framed payload: it is
/// forwarded verbatim over a fresh local TCP connection to `tcp_port`, and
/// the single response read back is relayed on the same WS message.
async fn run_ws_bridge(_ctx: Arc<ServerCtx>, ws_port: u16, tcp_port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ws_port)).await?;
    info!("control_server: websocket bridge listening on 0.0.0.0:{ws_port}");

    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_ws_connection(socket, tcp_port).await {
                warn!("control_server: ws bridge connection {peer} ended: {e}");
            }
        });
    }
}

async fn handle_ws_connection(socket: TcpStream, tcp_port: u16) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(socket).await?;
    while let Some(msg) = ws.next().await {
        let msg = msg?;
        let Message::Binary(payload) = msg else { continue };

        let local: SocketAddr = ([127, 0, 0, 1], tcp_port).into();
        let mut upstream = TcpStream::connect(local).await?;
        upstream.write_all(&payload).await?;

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        let reply = loop {
            let n = upstream.read(&mut buf).await?;
            if n == 0 {
                break None;
            }
            let frames = decoder.push(&buf[..n]);
            if let Some(frame) = frames.into_iter().next() {
                break Some(control_codec::encode(&frame));
            }
        };
        if let Some(reply) = reply {
            ws.send(Message::Binary(reply)).await?;
        }
    }
    Ok(())
}

async fn dispatch(cmd: Command, ctx: &Arc<ServerCtx>) -> Response {
    let op = match Opcode::from_u8(cmd.opcode) {
        Some(op) => op,
        None => return Response::error(cmd.opcode, ErrorCode::UnknownOrPrecondition),
    };

    match op {
        Opcode::AttachClient => {
            ctx.attached.store(true, Ordering::SeqCst);
            Response::ack(cmd.opcode, ctx.session_state.session_uuid().into_bytes())
        }
        Opcode::DetachClient => {
            if ctx.attached.swap(false, Ordering::SeqCst) {
                Response::ack(cmd.opcode, vec![])
            } else {
                Response::nack(cmd.opcode)
            }
        }
        Opcode::ConnectBle | Opcode::StartGateway => handle_connect(cmd, op, ctx).await,
        Opcode::DisconnectBle => {
            warn!("control_server: DisconnectBle is not supported as a standalone operation on this platform");
            Response::nack(cmd.opcode)
        }
        Opcode::StopGateway => {
            let mut slot = ctx.gateway.lock().await;
            if let Some(session) = slot.take() {
                session.request_shutdown().await;
                ctx.session_state.clear_device_data().await;
            }
            Response::ack(cmd.opcode, vec![])
        }
        Opcode::ScanHappDevices => handle_scan(cmd, ctx).await,
        Opcode::GetHid => match ctx.session_state.connected_hid() {
            Some(hid) => Response::ack(cmd.opcode, hid.into_bytes()),
            None => Response::nack(cmd.opcode),
        },
        Opcode::GetAlias => match ctx.session_state.connected_alias() {
            Some(alias) => Response::ack(cmd.opcode, alias.into_bytes()),
            None => Response::nack(cmd.opcode),
        },
        Opcode::SetAlias => {
            let Some(mac) = ctx.session_state.connected_mac() else {
                return Response::nack(cmd.opcode);
            };
            let Ok(alias) = String::from_utf8(cmd.body) else {
                return Response::error(cmd.opcode, ErrorCode::MissingParameter);
            };
            let id = mac_to_id(mac);
            if ctx.aliases.set(&id, &alias).is_err() {
                return Response::error(cmd.opcode, ErrorCode::UnexpectedException);
            }
            ctx.session_state.set_alias(alias).await;
            Response::ack(cmd.opcode, vec![])
        }
        Opcode::SetPsk => {
            if cmd.body.len() <= 32 {
                return Response::error(cmd.opcode, ErrorCode::MissingParameter);
            }
            let iprid = String::from_utf8_lossy(&cmd.body[..32]).to_string();
            let key = &cmd.body[32..];
            if ctx.psks.set(&iprid, &hex_encode(key)).is_err() {
                return Response::nack(cmd.opcode);
            }
            Response::ack(cmd.opcode, vec![])
        }
        Opcode::GetSessionUuid => {
            Response::ack(cmd.opcode, ctx.session_state.session_uuid().into_bytes())
        }
        Opcode::GetStatusCode => {
            Response::ack(cmd.opcode, vec![ctx.session_state.status() as u8])
        }
        // These opcodes are only ever server-initiated (pushed through
        // `ServerCtx::push_response`); a client sending one as a request has
        // nothing to ask for.
        Opcode::LeshanRegistered | Opcode::LeshanLost | Opcode::BtDisconnected => {
            Response::error(cmd.opcode, ErrorCode::UnknownOrPrecondition)
        }
    }
}

/// `ConnectBle` and `StartGateway` both end up starting the same underlying
/// `GatewaySession`, but they resolve the target device differently:
/// `StartGateway` (0x0E) requires `mac` to already be in `lastHAPPScan`,
/// retrying against it up to [`HAPP_SCAN_RETRIES`] times and returning
/// `ERROR(UnknownOrPrecondition)` on exhaustion; `ConnectBle` (0x07) has no
/// such precondition — it opportunistically checks the last scan, then falls
/// back to a live targeted scan, and simply NACKs if the device still isn't
/// found. See DESIGN.md for why they nonetheless share the session-start
/// plumbing.
async fn handle_connect(cmd: Command, op: Opcode, ctx: &Arc<ServerCtx>) -> Response {
    if cmd.body.len() < 7 {
        return Response::error(cmd.opcode, ErrorCode::MissingParameter);
    }
    let mut mac_bytes = [0u8; 6];
    mac_bytes.copy_from_slice(&cmd.body[0..6]);
    let timeout = Duration::from_secs(cmd.body[6] as u64);

    let reconnect = cmd.body.get(7).map(|&b| b != 0);
    let udp_dest = if op == Opcode::StartGateway && cmd.body.len() >= 26 {
        parse_ip_port_suffix(&cmd.body[8..26])
    } else {
        None
    };

    let scan_entry = if op == Opcode::StartGateway {
        let Some(entry) = find_scanned_device(ctx, mac_bytes).await else {
            return Response::error(cmd.opcode, ErrorCode::UnknownOrPrecondition);
        };
        entry
    } else {
        match ctx.session_state.last_scan().and_then(|scan| scan.iter().find(|e| e.mac == mac_bytes).cloned()) {
            Some(entry) => entry,
            None => {
                let found = discovery::scan_by_address(
                    ctx.config.adapter.as_deref(),
                    timeout,
                    mac_bytes,
                    ctx.config.write_uuid,
                    ctx.config.read_uuid,
                )
                .await
                .ok()
                .flatten();
                let Some(entry) = found else {
                    return Response::nack(cmd.opcode);
                };
                entry
            }
        }
    };
    let Ok(endpoint) = uuid::Uuid::parse_str(&scan_entry.endpoint_uuid) else {
        return if op == Opcode::StartGateway {
            Response::error(cmd.opcode, ErrorCode::UnknownOrPrecondition)
        } else {
            Response::nack(cmd.opcode)
        };
    };

    let gateway_config = GatewayConfig {
        mac: BDAddr::from(mac_bytes),
        addr_type: ctx.config.addr_type,
        adapter_name: ctx.config.adapter.clone(),
        write_uuid: ctx.config.write_uuid,
        read_uuid: ctx.config.read_uuid,
        mtu: ctx.config.mtu,
        udp_dest: udp_dest.unwrap_or(ctx.config.udp_dest),
        auto_reconnect: reconnect.unwrap_or(ctx.config.auto_reconnect),
        connect_timeout: timeout,
        push: ctx.push.clone(),
    };

    let opcode = cmd.opcode;
    let ctx = ctx.clone();

    tokio::spawn(start_session_and_verify(ctx, gateway_config, mac_bytes, endpoint, opcode));

    Response::ack(cmd.opcode, vec![])
}

async fn start_session_and_verify(
    ctx: Arc<ServerCtx>,
    gateway_config: GatewayConfig,
    mac: [u8; 6],
    endpoint: uuid::Uuid,
    opcode: u8,
) {
    // The gateway is call-stop, kill it: a still-running previous session
    // must be fully disconnected before the new one connects, else both
    // would pump the same BLE<->UDP path at once.
    if let Some(previous) = ctx.gateway.lock().await.take() {
        info!("control_server: stopping previous gateway session before starting a new one");
        previous.request_shutdown().await;
    }

    match GatewaySession::start(gateway_config, ctx.session_state.clone()).await {
        Ok(session) => {
            *ctx.gateway.lock().await = Some(session);
            ctx.session_state.adopt_device(mac, endpoint).await;
            push_psk_for_endpoint(&ctx, endpoint).await;
            push_framed(&ctx.push, Response::ack(0x0E, vec![]));
            verify_leshan_registration(ctx).await;
        }
        Err(e) => {
            error!("control_server: gateway start failed for opcode {opcode:#04x}: {e}");
            push_framed(&ctx.push, Response::nack(opcode));
        }
    }
}

/// Pushes the endpoint's stored PSK (if any was set via `SetPsk`) to Leshan
/// at session start, per the PSK store's "pushed to the LwM2M server on
/// session start" contract.
async fn push_psk_for_endpoint(ctx: &Arc<ServerCtx>, endpoint: uuid::Uuid) {
    let iprid = endpoint.simple().to_string();
    let Some(key) = ctx.psks.get(&iprid) else {
        return;
    };
    let client = LeshanClient::new(ctx.config.leshan_base_url.clone());
    if let Err(e) = client.push_psk(&iprid, &iprid, &key).await {
        warn!("control_server: push_psk failed for endpoint {iprid}: {e}");
    }
}

async fn verify_leshan_registration(ctx: Arc<ServerCtx>) {
    use hqv_protocol::session_state::Tri;

    let session_state = ctx.session_state.clone();
    let regular_status_request = ctx.config.regular_status_request;
    let push = ctx.push.clone();

    session_state.set_device_leshan_status(Tri::Retrieving).await;
    let client = LeshanClient::new(ctx.config.leshan_base_url.clone());
    // Leshan's `/api/clients` reports endpoints in hyphenated UUID ASCII,
    // distinct from the wire protocol's 32-char no-dash `session_uuid`.
    let endpoint = match session_state.connected_iprid() {
        Some(iprid) => iprid.hyphenated().to_string(),
        None => return,
    };

    for _ in 0..LESHAN_POLL_ATTEMPTS {
        match client.list_clients().await {
            Ok(clients) if clients.iter().any(|c| c.endpoint == endpoint) => {
                session_state.set_device_leshan_status(Tri::True).await;
                if let Ok(value) = client.get_resource(&endpoint, 27003, 0, 19).await {
                    if let Some(hid) = value.as_str() {
                        session_state.set_connected_hid(hid.to_string()).await;
                    }
                }
                push_framed(&push, Response::ack(0x15, vec![]));

                if regular_status_request {
                    loop {
                        time::sleep(LESHAN_REGULAR_POLL_INTERVAL).await;
                        match client.list_clients().await {
                            Ok(clients) if clients.iter().any(|c| c.endpoint == endpoint) => {}
                            _ => {
                                session_state.set_device_leshan_status(Tri::False).await;
                                push_framed(&push, Response::ack(0x16, vec![]));
                                break;
                            }
                        }
                    }
                }
                return;
            }
            _ => time::sleep(LESHAN_POLL_INTERVAL).await,
        }
    }
    error!("control_server: leshan registration verification exhausted after {LESHAN_POLL_ATTEMPTS} attempts");
    session_state.set_device_leshan_status(Tri::False).await;
    session_state.set_status(StatusCode::ConnectionLostLeshanError).await;
    push_framed(&push, Response::ack(0x16, vec![]));
}

fn push_framed(push: &broadcast::Sender<Vec<u8>>, response: Response) {
    let framed = control_codec::encode(&response.to_bytes());
    let _ = push.send(framed);
}

/// Finds `mac` in `last_scan`, retrying up to [`HAPP_SCAN_RETRIES`] times so
/// a `ConnectBle`/`StartGateway` that races a just-issued scan still succeeds.
async fn find_scanned_device(
    ctx: &ServerCtx,
    mac: [u8; 6],
) -> Option<hqv_protocol::session_state::ScanEntry> {
    for attempt in 0..HAPP_SCAN_RETRIES {
        if let Some(scan) = ctx.session_state.last_scan() {
            if let Some(entry) = scan.iter().find(|e| e.mac == mac) {
                return Some(entry.clone());
            }
        }
        if attempt + 1 < HAPP_SCAN_RETRIES {
            time::sleep(HAPP_SCAN_RETRY_WAIT).await;
        }
    }
    None
}

async fn handle_scan(cmd: Command, ctx: &ServerCtx) -> Response {
    let Some(&timeout_secs) = cmd.body.first() else {
        return Response::error(cmd.opcode, ErrorCode::MissingParameter);
    };

    let entries = match crate::discovery::scan_happ_devices(
        ctx.config.adapter.as_deref(),
        Duration::from_secs(timeout_secs as u64),
        ctx.config.write_uuid,
        ctx.config.read_uuid,
    )
    .await
    {
        Ok(entries) => entries,
        Err(e) => {
            warn!("control_server: HAPP scan failed: {e}");
            return Response::error(cmd.opcode, ErrorCode::UnexpectedException);
        }
    };

    ctx.session_state.set_last_scan(entries.clone()).await;

    let mut body = Vec::new();
    body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in &entries {
        body.extend_from_slice(&entry.mac);
        body.extend_from_slice(entry.endpoint_uuid.as_bytes());
        body.push(entry.notify_capable as u8);
        body.push(entry.write_capable as u8);
        body.extend_from_slice(entry.rssi.to_string().as_bytes());
        let id = mac_to_id(entry.mac);
        let alias = entry.alias.clone().or_else(|| ctx.aliases.get(&id)).unwrap_or_default();
        body.extend_from_slice(alias.as_bytes());
        body.push(0);
    }
    Response::ack(cmd.opcode, body)
}

fn mac_to_id(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `[ip(16) ascii/zero-padded][port(2) big-endian]` suffix decoding.
fn parse_ip_port_suffix(bytes: &[u8]) -> Option<SocketAddr> {
    let ip_bytes = &bytes[0..16];
    let ip_str = ip_bytes
        .split(|&b| b == 0)
        .next()
        .map(|s| String::from_utf8_lossy(s).to_string())?;
    let ip: std::net::IpAddr = ip_str.parse().ok()?;
    let port = u16::from_be_bytes([bytes[16], bytes[17]]);
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_port_suffix_reads_zero_padded_ascii() {
        let mut bytes = [0u8; 18];
        bytes[..9].copy_from_slice(b"127.0.0.1");
        bytes[16..18].copy_from_slice(&5684u16.to_be_bytes());
        let addr = parse_ip_port_suffix(&bytes).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:5684");
    }

    #[test]
    fn mac_to_id_is_lowercase_hex() {
        assert_eq!(mac_to_id([0xAA, 0xBB, 0x00, 0x01, 0x02, 0xFF]), "aabb000102ff");
    }
}
