//! Bound UDP socket with a bi-directional queue and bounded send-retry
//!.

use std::net::SocketAddr;

use log::{debug, error, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender};

const RECV_BUF_SIZE: usize = 1024;
const SEND_RETRIES: usize = 3;

pub struct UdpEndpoint {
    socket: UdpSocket,
    dest: SocketAddr,
    send_tx: Sender<Vec<u8>>,
    send_rx: Option<Receiver<Vec<u8>>>,
}

impl UdpEndpoint {
    /// Binds to `0.0.0.0:0`, or to `127.0.0.1:0` when `dest` is loopback
    /// (so a loopback-only Leshan/CoAP test stack is reachable without
    /// opening a socket on every interface).
    pub async fn bind(dest: SocketAddr) -> hqv_protocol::Result<Self> {
        let bind_addr: SocketAddr = if dest.ip().is_loopback() {
            "127.0.0.1:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("udp_endpoint: bound to {}, sending to {dest}", socket.local_addr()?);

        let (send_tx, send_rx) = mpsc::channel(64);
        Ok(UdpEndpoint {
            socket,
            dest,
            send_tx,
            send_rx: Some(send_rx),
        })
    }

    /// A cloneable handle for queuing outbound datagrams FIFO.
    pub fn sender(&self) -> Sender<Vec<u8>> {
        self.send_tx.clone()
    }

    /// Takes the send queue's receiver so [`Self::run_send_loop`] can run
    /// concurrently with [`Self::run_recv_loop`] over a shared `Arc<Self>` —
    /// `UdpSocket::send_to`/`recv_from` both take `&self`, so only the
    /// one-time receiver handoff needs exclusive access.
    pub fn take_send_queue(&mut self) -> Receiver<Vec<u8>> {
        self.send_rx
            .take()
            .expect("take_send_queue called more than once")
    }

    /// Drives the send loop: reads queued datagrams and writes them to the
    /// socket, retrying short sends up to [`SEND_RETRIES`] times before
    /// dropping the datagram with a warning. Returns when the sender side is
    /// closed (graceful shutdown).
    pub async fn run_send_loop(&self, mut rx: Receiver<Vec<u8>>) {
        while let Some(data) = rx.recv().await {
            self.send_with_retry(&data).await;
        }
    }

    async fn send_with_retry(&self, data: &[u8]) {
        for attempt in 0..SEND_RETRIES {
            match self.socket.send_to(data, self.dest).await {
                Ok(sent) if sent == data.len() => return,
                Ok(sent) => {
                    warn!(
                        "udp_endpoint: short send ({sent}/{} bytes), attempt {}/{SEND_RETRIES}",
                        data.len(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    warn!("udp_endpoint: send error: {e}, attempt {}/{SEND_RETRIES}", attempt + 1);
                }
            }
        }
        error!(
            "udp_endpoint: dropping {}-byte datagram after {SEND_RETRIES} short sends",
            data.len()
        );
    }

    /// Blocking-style receive loop (a tokio task awaiting `recv_from`) that
    /// invokes `on_recv` for every datagram. The peer's source address is
    /// ignored — the remote endpoint is identified by `dest` at bind time.
    pub async fn run_recv_loop(&self, mut on_recv: impl FnMut(Vec<u8>)) -> hqv_protocol::Result<()> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (len, _src) = self.socket.recv_from(&mut buf).await?;
            on_recv(buf[..len].to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_recv_round_trip_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut endpoint = UdpEndpoint::bind(server_addr).await.unwrap();
        let sender = endpoint.sender();
        let send_rx = endpoint.take_send_queue();

        let send_task = tokio::spawn(async move {
            endpoint.run_send_loop(send_rx).await;
        });

        sender.send(b"hello".to_vec()).await.unwrap();
        drop(sender);

        let mut buf = [0u8; 16];
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");

        send_task.await.unwrap();
    }
}
