use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::common::find_magic_mac;
use crate::config::Layer4Config;
use crate::error::{Error, Result};
use crate::event::{forward, WolEvent};

/// Upper bound on a blocked read, so cancellation is noticed promptly.
pub const READ_TIMEOUT: Duration = Duration::from_millis(750);

const RECV_BUF_LEN: usize = 4096;
const SOCKET_RCVBUF: usize = 1 << 20;

/// The running per-port read loops.
pub struct UdpListeners {
    tasks: JoinSet<()>,
    local_addrs: Vec<SocketAddr>,
}

impl UdpListeners {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Waits for every read loop to exit.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                log::error!("[layer4] listener task failed: {}", e);
            }
        }
    }
}

/// Opens one UDP socket per configured port, optionally bound to `iface`.
pub fn bind(listen_addr: Ipv4Addr, port: u16, iface: Option<&str>) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_reuse_address(true) {
        log::debug!("[layer4][:{}] SO_REUSEADDR not set: {}", port, e);
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_RCVBUF) {
        log::debug!("[layer4][:{}] SO_RCVBUF not set: {}", port, e);
    }
    if let Some(iface) = iface {
        bind_device(&socket, iface)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(listen_addr, port)).into())?;
    Ok(socket.into())
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_socket: &Socket, iface: &str) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, format!("cannot bind to device {iface} on this platform")))
}

/// Starts a read loop for every port that could be bound.
///
/// Ports that fail to bind are logged and skipped; only when none of them can be
/// bound is an error returned. Must be called from within a tokio runtime.
pub fn spawn(cfg: &Layer4Config, iface: Option<&str>, tx: SyncSender<WolEvent>, token: CancellationToken) -> Result<UdpListeners> {
    let mut tasks = JoinSet::new();
    let mut local_addrs = Vec::new();

    for &port in &cfg.ports {
        let socket = match bind(cfg.listen_addr, port, iface).and_then(UdpSocket::from_std) {
            Ok(socket) => socket,
            Err(source) => {
                log::error!("[layer4] {}", Error::UdpBind { port, source });
                continue;
            },
        };
        let local = socket.local_addr()?;
        log::info!("[layer4] listening on udp {}{}", local,
            iface.map(|i| format!(" (bound to {i})")).unwrap_or_default());

        local_addrs.push(local);
        tasks.spawn(listen(socket, tx.clone(), token.clone()));
    }

    if tasks.is_empty() {
        return Err(Error::NoUdpListener(cfg.ports.clone()));
    }
    Ok(UdpListeners { tasks, local_addrs })
}

async fn listen(socket: UdpSocket, tx: SyncSender<WolEvent>, token: CancellationToken) {
    let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
    let mut buf = vec![0u8; RECV_BUF_LEN];

    loop {
        if token.is_cancelled() { log::trace!("[layer4][:{}] exit", port); break; }

        let (len, peer) = match tokio::time::timeout(READ_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                if token.is_cancelled() { break; }
                log::warn!("[layer4][:{}] read error: {}", port, e);
                continue;
            },
            Err(_elapsed) => continue,
        };

        let Some(target) = find_magic_mac(&buf[..len]) else {
            log::trace!("[layer4][:{}] {} byte datagram from {} is not a magic packet", port, len, peer);
            continue;
        };
        log::debug!("[layer4][:{}] magic packet for {} from {}", port, target, peer);

        let event = WolEvent {
            target,
            source: format!("udp {}", peer),
            source_ip: Some(peer.ip()),
        };
        if !forward(&tx, event) { log::trace!("[layer4][:{}] dispatcher gone", port); break; }
    }
}
