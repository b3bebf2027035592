use std::io::ErrorKind;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use pnet::datalink::{
    self,
    DataLinkReceiver,
    NetworkInterface
};
use pnet::packet::{
    ethernet::EthernetPacket,
    Packet
};
use tokio_util::sync::CancellationToken;

use crate::common::find_magic_mac;
use crate::error::{Error, Result};
use crate::event::{forward, WolEvent};

pub const ETHERTYPE_WOL: u16 = 0x0842;

/// dst(6) + src(6) + ethertype(2)
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Receive timeout of the datalink channel; bounds how long cancellation goes unnoticed.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Raw Ethernet listener for EtherType 0x0842 frames on one interface.
pub struct Layer2Listener {
    name: String,
    rx: Box<dyn DataLinkReceiver>,
}

/// Turns a captured Ethernet frame into an event if it carries a magic packet.
pub fn frame_event(iface: &str, frame: &[u8]) -> Option<WolEvent> {
    if frame.len() <= ETHERNET_HEADER_LEN { return None; }

    let eth_pkt = EthernetPacket::new(frame)?;
    if eth_pkt.get_ethertype().0 != ETHERTYPE_WOL { return None; }

    let target = find_magic_mac(eth_pkt.payload())?;
    log::debug!("[layer2][{}] WakeOnLan frame for {} from {}", iface, target, eth_pkt.get_source());

    Some(WolEvent {
        target,
        source: format!("ether {}", iface),
        source_ip: None,
    })
}

/// Opens the raw socket on `name`. An empty name disables the listener.
pub fn open(name: &str) -> Result<Option<Layer2Listener>> {
    if name.is_empty() {
        log::info!("[layer2] no interface configured, raw listener disabled");
        return Ok(None);
    }

    let iface = datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;
    if !iface.is_up() {
        log::warn!("[layer2][{}] interface is down", iface.name);
    }

    let rx = wol_channel(&iface)?;
    log::info!("[layer2] listening on {} (index {}) for ethertype 0x{:04x}", iface.name, iface.index, ETHERTYPE_WOL);

    Ok(Some(Layer2Listener { name: iface.name, rx }))
}

/// Packet socket that only receives EtherType 0x0842 on `iface`, headers included.
///
/// pnet's Layer2 channel type would listen on ETH_P_ALL, so the socket is created here
/// with the WOL protocol and handed over. Binding with `Layer3(ETHERTYPE_WOL)` keeps
/// the kernel filter in place while the socket itself stays SOCK_RAW.
#[cfg(target_os = "linux")]
fn wol_channel(iface: &NetworkInterface) -> Result<Box<dyn DataLinkReceiver>> {
    use pnet::datalink::{Channel, ChannelType, Config};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::fd::IntoRawFd;

    let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(i32::from(ETHERTYPE_WOL.to_be()))))?;

    let mut dl_cfg = Config::default();
    dl_cfg.read_timeout = Some(READ_TIMEOUT);
    dl_cfg.channel_type = ChannelType::Layer3(ETHERTYPE_WOL);
    dl_cfg.promiscuous = false;
    // pnet owns and closes the descriptor from here on
    dl_cfg.socket_fd = Some(socket.into_raw_fd());

    match datalink::channel(iface, dl_cfg) {
        Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
        Ok(_) => Err(Error::UnsupportedChannel(iface.name.clone())),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(not(target_os = "linux"))]
fn wol_channel(iface: &NetworkInterface) -> Result<Box<dyn DataLinkReceiver>> {
    Err(Error::UnsupportedChannel(iface.name.clone()))
}

impl Layer2Listener {
    /// Blocking receive loop; run it on its own thread.
    ///
    /// Returns `Ok` on cancellation and when the dispatcher goes away. Any receive
    /// error other than a timeout or interruption is fatal.
    pub fn run(mut self, tx: SyncSender<WolEvent>, token: CancellationToken) -> Result<()> {
        loop {
            if token.is_cancelled() { log::trace!("[layer2][{}] exit", self.name); return Ok(()); }

            let frame = match self.rx.next() {
                Ok(frame) => frame,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => continue,
                Err(_) if token.is_cancelled() => return Ok(()),
                Err(source) => return Err(Error::RawReceive { iface: self.name.clone(), source }),
            };

            let Some(event) = frame_event(&self.name, frame) else { continue; };
            if !forward(&tx, event) {
                log::trace!("[layer2][{}] dispatcher gone", self.name);
                return Ok(());
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BROADCAST_MAC, MAC_REPETITIONS};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::mpsc;
    use std::time::Instant;

    enum Step {
        Frame(Vec<u8>),
        Fail(ErrorKind),
        /// Cancels, then fails the read the way a closed socket would.
        CancelThenFail(CancellationToken),
    }

    /// Replays a fixed sequence of reads, then times out forever.
    struct Scripted {
        steps: VecDeque<Step>,
        current: Vec<u8>,
    }

    impl DataLinkReceiver for Scripted {
        fn next(&mut self) -> io::Result<&[u8]> {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => {
                    self.current = frame;
                    Ok(&self.current)
                },
                Some(Step::Fail(kind)) => Err(kind.into()),
                Some(Step::CancelThenFail(token)) => {
                    token.cancel();
                    Err(io::Error::other("bad file descriptor"))
                },
                None => {
                    std::thread::sleep(READ_TIMEOUT);
                    Err(ErrorKind::TimedOut.into())
                },
            }
        }
    }

    fn scripted(steps: Vec<Step>) -> Layer2Listener {
        Layer2Listener {
            name: "test0".into(),
            rx: Box::new(Scripted { steps: steps.into(), current: Vec::new() }),
        }
    }

    fn wol_ether_frame() -> Vec<u8> {
        frame(ETHERTYPE_WOL, &magic_packet([ 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff ]))
    }

    fn frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = BROADCAST_MAC.to_vec();
        frame.extend_from_slice(&[ 0x52, 0x54, 0x00, 0x12, 0x34, 0x56 ]);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn magic_packet(mac: [u8; 6]) -> Vec<u8> {
        let mut pkt = BROADCAST_MAC.to_vec();
        for _ in 0..MAC_REPETITIONS {
            pkt.extend_from_slice(&mac);
        }
        pkt
    }

    #[test]
    fn wol_frame() {
        let mut payload = magic_packet([ 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff ]);
        // minimum frame padding
        payload.extend_from_slice(&[0; 6]);
        let event = frame_event("br0", &frame(ETHERTYPE_WOL, &payload)).unwrap();
        assert_eq!(event.target.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(event.source, "ether br0");
        assert_eq!(event.source_ip, None);
    }

    #[test]
    fn other_ethertype_ignored() {
        let payload = magic_packet([ 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff ]);
        assert!(frame_event("br0", &frame(0x0800, &payload)).is_none());
    }

    #[test]
    fn short_or_garbage_frames_ignored() {
        assert!(frame_event("br0", &[]).is_none());
        assert!(frame_event("br0", &frame(ETHERTYPE_WOL, &[])).is_none());
        assert!(frame_event("br0", &frame(ETHERTYPE_WOL, &[0xff; 50])).is_none());
        assert!(frame_event("br0", &frame(ETHERTYPE_WOL, &magic_packet([0; 6]))).is_none());
    }

    #[test]
    fn header_bytes_are_not_part_of_the_payload() {
        // the sync stream would only be complete if the broadcast destination counted
        let mut payload = magic_packet([ 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff ]);
        payload.drain(..6);
        payload.extend_from_slice(&[0; 6]);
        assert!(frame_event("br0", &frame(ETHERTYPE_WOL, &payload)).is_none());
    }

    #[test]
    fn empty_interface_is_a_no_op() {
        assert!(open("").unwrap().is_none());
    }

    #[test]
    fn unknown_interface() {
        assert!(matches!(open("wolwake-nonexistent0"), Err(Error::InterfaceNotFound(_))));
    }

    #[test]
    fn read_loop_survives_timeouts_and_interrupts() {
        let listener = scripted(vec![
            Step::Fail(ErrorKind::TimedOut),
            Step::Fail(ErrorKind::WouldBlock),
            Step::Fail(ErrorKind::Interrupted),
            Step::Frame(frame(0x0800, &[0; 64])),
            Step::Frame(wol_ether_frame()),
        ]);
        let (tx, rx) = mpsc::sync_channel(4);
        let token = CancellationToken::new();

        let worker = {
            let token = token.clone();
            std::thread::spawn(move || listener.run(tx, token))
        };

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.target.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(event.source, "ether test0");

        token.cancel();
        assert!(worker.join().unwrap().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn read_loop_exits_promptly_on_cancel() {
        let listener = scripted(Vec::new());
        let (tx, _rx) = mpsc::sync_channel(4);
        let token = CancellationToken::new();

        let worker = {
            let token = token.clone();
            std::thread::spawn(move || listener.run(tx, token))
        };
        std::thread::sleep(Duration::from_millis(20));

        let cancelled_at = Instant::now();
        token.cancel();
        assert!(worker.join().unwrap().is_ok());
        assert!(cancelled_at.elapsed() < READ_TIMEOUT * 10);
    }

    #[test]
    fn receive_error_after_cancel_is_shutdown() {
        let token = CancellationToken::new();
        let listener = scripted(vec![Step::CancelThenFail(token.clone())]);
        let (tx, _rx) = mpsc::sync_channel(4);
        assert!(listener.run(tx, token).is_ok());
    }

    #[test]
    fn other_receive_errors_are_fatal() {
        let listener = scripted(vec![Step::Fail(ErrorKind::ConnectionReset)]);
        let (tx, _rx) = mpsc::sync_channel(4);
        match listener.run(tx, CancellationToken::new()) {
            Err(Error::RawReceive { iface, source }) => {
                assert_eq!(iface, "test0");
                assert_eq!(source.kind(), ErrorKind::ConnectionReset);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn read_loop_stops_when_dispatcher_gone() {
        let listener = scripted(vec![Step::Frame(wol_ether_frame())]);
        let (tx, rx) = mpsc::sync_channel(4);
        drop(rx);
        let token = CancellationToken::new();
        assert!(listener.run(tx, token.clone()).is_ok());
        assert!(!token.is_cancelled());
    }

    /// `None` when raw sockets are not permitted for this user.
    fn open_loopback() -> Option<Layer2Listener> {
        match open("lo") {
            Ok(listener) => listener,
            Err(Error::Io(e)) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("skipping: raw sockets need CAP_NET_RAW");
                None
            },
            Err(e) => panic!("cannot open raw socket on lo: {e}"),
        }
    }

    fn loopback_is_promiscuous() -> bool {
        let flags = std::fs::read_to_string("/sys/class/net/lo/flags").unwrap();
        let flags = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).unwrap();
        flags & 0x100 != 0
    }

    #[test]
    fn raw_socket_is_filtered_to_wol_ethertype() {
        let Some(mut listener) = open_loopback() else { return; };
        assert!(!loopback_is_promiscuous());

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..20 {
            sender.send_to(b"plain datagram", sink.local_addr().unwrap()).unwrap();
        }

        let mut seen = Vec::new();
        let deadline = Instant::now() + READ_TIMEOUT * 6;
        while Instant::now() < deadline {
            match listener.rx.next() {
                Ok(frame) => seen.push(EthernetPacket::new(frame).map(|eth| eth.get_ethertype().0)),
                Err(e) => assert!(matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted), "{e}"),
            }
        }
        assert!(seen.iter().all(|ethertype| *ethertype == Some(ETHERTYPE_WOL)), "saw {seen:x?}");
    }

    #[test]
    fn wol_frame_on_loopback_becomes_an_event() {
        let Some(listener) = open_loopback() else { return; };
        let (tx, rx) = mpsc::sync_channel(4);
        let token = CancellationToken::new();
        let worker = {
            let token = token.clone();
            std::thread::spawn(move || listener.run(tx, token))
        };

        let lo = datalink::interfaces().into_iter().find(|iface| iface.name == "lo").unwrap();
        let mut dl_cfg = datalink::Config::default();
        dl_cfg.promiscuous = false;
        let mut lo_tx = match datalink::channel(&lo, dl_cfg) {
            Ok(datalink::Channel::Ethernet(tx, _rx)) => tx,
            _ => panic!("no ethernet channel on lo"),
        };

        let mut event = None;
        for _ in 0..10 {
            lo_tx.send_to(&wol_ether_frame(), None).unwrap().unwrap();
            if let Ok(ev) = rx.recv_timeout(READ_TIMEOUT * 4) {
                event = Some(ev);
                break;
            }
        }

        token.cancel();
        assert!(worker.join().unwrap().is_ok());
        let event = event.expect("no event for the frame sent on lo");
        assert_eq!(event.target.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(event.source, "ether lo");
    }
}
