//! Owns one connection to one BLE peripheral: connect, notify, write,
//! disconnect, reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use hqv_protocol::AgentError;
use log::{error, info, warn};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Instant};
use uuid::Uuid;

const SCAN_ATTEMPTS: u32 = 3;
const SCAN_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DISCONNECT_WATCHDOG: Duration = Duration::from_secs(5);

const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Whether a disconnect finished cleanly or the watchdog had to win the race
/// against an unresponsive underlying stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Graceful,
    Unsafe,
}

/// An event surfaced to the owning `GatewaySession` / control channel.
#[derive(Debug, Clone)]
pub enum BleLinkEvent {
    Connected,
    Disconnected { outcome: DisconnectOutcome },
    /// An unsolicited disconnect exhausted every reconnect attempt.
    ReconnectFailed,
}

/// A single platform-escape signal the error handler can set when the
/// underlying BLE stack hangs, so the disconnect watchdog can resolve the
/// race instead of blocking shutdown forever.
#[derive(Clone, Default)]
pub struct PlatformEscape(Arc<tokio::sync::Notify>);

impl PlatformEscape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.notify_waiters();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

pub struct BleLink {
    adapter: Adapter,
    address: btleplug::api::BDAddr,
    write_uuid: Uuid,
    read_uuid: Uuid,
    auto_reconnect: bool,
    connect_timeout: Duration,

    write_tx: Sender<Option<Vec<u8>>>,
    write_rx: Option<Receiver<Option<Vec<u8>>>>,
    notify_tx: Sender<Vec<u8>>,
    unsolicited_tx: Sender<()>,

    requested_disconnect: Arc<AtomicBool>,
    platform_escape: PlatformEscape,

    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    /// The send loop's current write target, shared so a successful
    /// reconnect can swap in the freshly-resolved peripheral/characteristic
    /// without needing to respawn or re-plumb the loop's receiver.
    active: Arc<std::sync::Mutex<Option<(Peripheral, Characteristic)>>>,
}

impl BleLink {
    /// Returns the link, a receiver of raw notification fragments, and a
    /// receiver that fires once per unsolicited disconnect (stack-reported,
    /// not requested via [`Self::stop`]).
    pub async fn new(
        adapter: Adapter,
        address: btleplug::api::BDAddr,
        write_uuid: Uuid,
        read_uuid: Uuid,
        auto_reconnect: bool,
        connect_timeout: Duration,
    ) -> (Self, Receiver<Vec<u8>>, Receiver<()>) {
        let (write_tx, write_rx) = mpsc::channel(256);
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(8);

        (
            BleLink {
                adapter,
                address,
                write_uuid,
                read_uuid,
                auto_reconnect,
                connect_timeout,
                write_tx,
                write_rx: Some(write_rx),
                notify_tx,
                unsolicited_tx,
                requested_disconnect: Arc::new(AtomicBool::new(false)),
                platform_escape: PlatformEscape::new(),
                peripheral: None,
                write_char: None,
                active: Arc::new(std::sync::Mutex::new(None)),
            },
            notify_rx,
            unsolicited_rx,
        )
    }

    pub fn platform_escape(&self) -> PlatformEscape {
        self.platform_escape.clone()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// A FIFO write queue handle; `None` is the shutdown sentinel consumed
    /// by [`Self::drive_send_loop`].
    pub fn write_queue(&self) -> Sender<Option<Vec<u8>>> {
        self.write_tx.clone()
    }

    pub fn queue_write(&self, bytes: Vec<u8>) {
        let _ = self.write_tx.try_send(Some(bytes));
    }

    /// Scans up to [`SCAN_ATTEMPTS`] times, then connects up to
    /// [`CONNECT_ATTEMPTS`] times with [`CONNECT_BACKOFF`] between attempts.
    /// Resolves characteristics and subscribes to notifications. Returns
    /// once the link is ready or definitively failed.
    pub async fn start(&mut self) -> hqv_protocol::Result<()> {
        let peripheral = self.scan_for_target().await?;
        self.connect_with_retry(&peripheral).await?;

        peripheral.discover_services().await.map_err(ble_err)?;
        let chars = peripheral.characteristics();

        let write_char = chars
            .iter()
            .find(|c| c.uuid == self.write_uuid)
            .cloned()
            .ok_or(AgentError::BleCharacteristicMissing {
                uuid: self.write_uuid,
                required: "write-without-response",
            })?;
        if !write_char
            .properties
            .contains(btleplug::api::CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            return Err(AgentError::BleCharacteristicMissing {
                uuid: self.write_uuid,
                required: "write-without-response",
            });
        }

        let read_char = chars
            .iter()
            .find(|c| c.uuid == self.read_uuid)
            .cloned()
            .ok_or(AgentError::BleCharacteristicMissing {
                uuid: self.read_uuid,
                required: "notify",
            })?;
        if !read_char.properties.contains(btleplug::api::CharPropFlags::NOTIFY) {
            return Err(AgentError::BleCharacteristicMissing {
                uuid: self.read_uuid,
                required: "notify",
            });
        }

        peripheral.subscribe(&read_char).await.map_err(ble_err)?;
        self.spawn_notification_forwarder(&peripheral, read_char.uuid);
        self.spawn_disconnect_watcher(&peripheral).await?;

        *self.active.lock().unwrap() = Some((peripheral.clone(), write_char.clone()));
        self.peripheral = Some(peripheral);
        self.write_char = Some(write_char);
        info!("ble_link: connected and subscribed");
        Ok(())
    }

    /// Watches the adapter's event stream for a `DeviceDisconnected` matching
    /// our peripheral. Fires [`Self::unsolicited_tx`] once, unless the
    /// disconnect was requested via [`Self::stop`] (checked at delivery
    /// time, since `stop()` can race a disconnect already in flight).
    async fn spawn_disconnect_watcher(&self, peripheral: &Peripheral) -> hqv_protocol::Result<()> {
        let mut events = self.adapter.events().await.map_err(ble_err)?;
        let peripheral_id = peripheral.id();
        let requested_disconnect = self.requested_disconnect.clone();
        let unsolicited_tx = self.unsolicited_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        if !requested_disconnect.load(Ordering::SeqCst) {
                            let _ = unsolicited_tx.send(()).await;
                        }
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn scan_for_target(&self) -> hqv_protocol::Result<Peripheral> {
        for attempt in 1..=SCAN_ATTEMPTS {
            info!("ble_link: scan attempt {attempt}/{SCAN_ATTEMPTS}");
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(ble_err)?;

            let mut events = self.adapter.events().await.map_err(ble_err)?;
            let deadline = Instant::now() + SCAN_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match time::timeout(remaining, events.next()).await {
                    Ok(Some(CentralEvent::DeviceDiscovered(id))) => {
                        if let Ok(p) = self.adapter.peripheral(&id).await {
                            if let Ok(Some(props)) = p.properties().await {
                                if props.address == self.address {
                                    self.adapter.stop_scan().await.ok();
                                    return Ok(p);
                                }
                            }
                        }
                    }
                    Ok(Some(_)) => {}
                    _ => break,
                }
            }
            self.adapter.stop_scan().await.ok();
        }
        error!("ble_link: device not found after {SCAN_ATTEMPTS} scan attempts");
        Err(AgentError::BleScanMiss)
    }

    async fn connect_with_retry(&self, peripheral: &Peripheral) -> hqv_protocol::Result<()> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match time::timeout(self.connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => warn!("ble_link: connect attempt {attempt} failed: {e}"),
                Err(_) => warn!("ble_link: connect attempt {attempt} timed out"),
            }
            time::sleep(CONNECT_BACKOFF).await;
        }
        error!("ble_link: connect attempts exhausted after {CONNECT_ATTEMPTS} tries");
        Err(AgentError::BleConnectFailed)
    }

    fn spawn_notification_forwarder(&self, peripheral: &Peripheral, read_uuid: Uuid) {
        let notify_tx = self.notify_tx.clone();
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("ble_link: failed to open notification stream: {e}");
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                if notification.uuid == read_uuid && notify_tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Takes the pieces [`Self::drive_send_loop`] needs under a brief lock,
    /// so the caller can release the `BleLink` mutex before awaiting the
    /// long-lived send loop — otherwise a `Mutex<BleLink>` held across the
    /// whole loop would starve `stop()`/reconnect, which also need the lock.
    pub fn take_send_loop_parts(
        &mut self,
    ) -> Option<(Receiver<Option<Vec<u8>>>, Arc<std::sync::Mutex<Option<(Peripheral, Characteristic)>>>)> {
        let rx = self.write_rx.take()?;
        Some((rx, self.active.clone()))
    }

    /// Drains the write queue, performing a write-without-response for each
    /// item against whatever peripheral/characteristic is currently active
    /// (see [`Self::take_send_loop_parts`]) — re-read per item so a
    /// mid-session reconnect's freshly-resolved characteristic takes effect
    /// without respawning this loop. A `None` sentinel terminates the loop.
    pub async fn drive_send_loop(
        mut rx: Receiver<Option<Vec<u8>>>,
        active: Arc<std::sync::Mutex<Option<(Peripheral, Characteristic)>>>,
    ) {
        while let Some(item) = rx.recv().await {
            match item {
                Some(bytes) => {
                    let target = active.lock().unwrap().clone();
                    match target {
                        Some((peripheral, write_char)) => {
                            if let Err(e) = peripheral
                                .write(&write_char, &bytes, WriteType::WithoutResponse)
                                .await
                            {
                                warn!("ble_link: write failed: {e}");
                            }
                        }
                        None => warn!("ble_link: dropping write, no active peripheral"),
                    }
                }
                None => break,
            }
        }
    }

    /// Graceful shutdown: unsubscribe, mark the disconnect as requested (so
    /// it does not trigger reconnect), then race the disconnect against a
    /// bounded watchdog and the platform-escape event.
    pub async fn stop(&self) -> DisconnectOutcome {
        self.requested_disconnect.store(true, Ordering::SeqCst);
        let _ = self.write_tx.send(None).await;

        let Some(peripheral) = self.peripheral.clone() else {
            return DisconnectOutcome::Graceful;
        };

        let disconnect = peripheral.disconnect();
        let watchdog = time::sleep(DISCONNECT_WATCHDOG);
        let escape = self.platform_escape.wait();

        tokio::select! {
            result = disconnect => {
                match result {
                    Ok(()) => DisconnectOutcome::Graceful,
                    Err(_) => DisconnectOutcome::Unsafe,
                }
            }
            _ = watchdog => DisconnectOutcome::Unsafe,
            _ = escape => DisconnectOutcome::Unsafe,
        }
    }

    /// Runs the bounded auto-reconnect loop after an unsolicited disconnect:
    /// up to [`RECONNECT_ATTEMPTS`] attempts, each a
    /// [`RECONNECT_SCAN_TIMEOUT`] scan plus a [`RECONNECT_CONNECT_TIMEOUT`]
    /// connect, with [`RECONNECT_BACKOFF`] between attempts. Aborts
    /// immediately if `stop()` was requested.
    pub async fn reconnect_loop(&mut self) -> hqv_protocol::Result<()> {
        if !self.auto_reconnect {
            return Err(AgentError::BleConnectFailed);
        }
        for attempt in 1..=RECONNECT_ATTEMPTS {
            if self.requested_disconnect.load(Ordering::SeqCst) {
                return Err(AgentError::BleConnectFailed);
            }
            info!("ble_link: reconnect attempt {attempt}/{RECONNECT_ATTEMPTS}");

            let scan = time::timeout(RECONNECT_SCAN_TIMEOUT, self.scan_for_target());
            let peripheral = match scan.await {
                Ok(Ok(p)) => p,
                _ => {
                    time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            let connect = time::timeout(RECONNECT_CONNECT_TIMEOUT, peripheral.connect());
            if connect.await.is_err() {
                time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }

            if self.start().await.is_ok() {
                return Ok(());
            }
            time::sleep(RECONNECT_BACKOFF).await;
        }
        error!("ble_link: reconnect attempts exhausted after {RECONNECT_ATTEMPTS} tries");
        Err(AgentError::BleConnectFailed)
    }
}

fn ble_err(e: btleplug::Error) -> AgentError {
    AgentError::Transport(std::io::Error::other(e))
}

pub async fn get_adapter(name: Option<&str>) -> hqv_protocol::Result<Adapter> {
    let manager = Manager::new().await.map_err(std::io::Error::other)?;
    let adapters = manager.adapters().await.map_err(std::io::Error::other)?;
    match name {
        Some(want) => {
            for a in adapters {
                if let Ok(info) = a.adapter_info().await {
                    if info.contains(want) {
                        return Ok(a);
                    }
                }
            }
            Err(AgentError::Config(format!("no adapter matching {want:?}")))
        }
        None => adapters
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Config("no BLE adapters found".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn platform_escape_wakes_a_waiter() {
        let escape = PlatformEscape::new();
        let waiter = escape.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::task::yield_now().await;
        escape.signal();
        handle.await.unwrap();
    }
}
