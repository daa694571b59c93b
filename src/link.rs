//! UDP transport to the remote client. One datagram carries one message.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::{Telemetry, TelemetrySink};

/// Largest inbound message is the 85-byte profile upload.
const RECV_BUFFER_LEN: usize = 512;

/// Most clients served at once. A new one evicts the quietest.
const MAX_PEERS: usize = 4;

/// Clients silent for this long stop receiving telemetry.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Peer {
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Peers {
    active: Vec<Peer>,
    joined: Vec<SocketAddr>,
}

impl Peers {
    fn seen(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(peer) = self.active.iter_mut().find(|p| p.addr == addr) {
            peer.last_seen = now;
            return;
        }

        if self.active.len() >= MAX_PEERS {
            if let Some(quietest) = self
                .active
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(i, _)| i)
            {
                let dropped = self.active.remove(quietest);
                log::info!("Dropping client {} to make room for {}", dropped.addr, addr);
            }
        }

        log::info!("Client connected from {}", addr);
        self.active.push(Peer {
            addr,
            last_seen: now,
        });
        self.joined.push(addr);
    }

    fn expire(&mut self, now: Instant) {
        self.active.retain(|peer| {
            let alive = now.saturating_duration_since(peer.last_seen) < PEER_TIMEOUT;
            if !alive {
                log::info!("Client {} timed out", peer.addr);
            }
            alive
        });
    }
}

pub struct UdpLink {
    socket: UdpSocket,
    peers: Mutex<Peers>,
}

impl UdpLink {
    /// Bind in non-blocking mode.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            peers: Mutex::new(Peers::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn lock_peers(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.lock_peers().active.iter().map(|peer| peer.addr).collect()
    }

    /// Clients that joined since the last call.
    pub fn take_joined(&self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.lock_peers().joined)
    }

    /// Drain every pending datagram. Senders become telemetry peers and
    /// peers silent for `PEER_TIMEOUT` are forgotten.
    pub fn poll_incoming(&self) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    self.lock_peers().seen(addr, Instant::now());
                    messages.push(buf[..len].to_vec());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("UDP receive failed: {}", e);
                    break;
                }
            }
        }

        self.lock_peers().expire(Instant::now());
        messages
    }
}

impl TelemetrySink for UdpLink {
    fn send(&self, telemetry: &Telemetry) {
        let datagram = telemetry.encode();
        for peer in self.peers() {
            if let Err(e) = self.socket.send_to(&datagram, peer) {
                log::debug!("UDP send to {} failed: {}", peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn client() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        socket
    }

    fn poll_until(link: &UdpLink, count: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < count && Instant::now() < deadline {
            received.extend(link.poll_incoming());
            thread::sleep(Duration::from_millis(5));
        }
        received
    }

    #[test]
    fn test_poll_incoming_empty() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        assert!(link.poll_incoming().is_empty());
        assert!(link.peers().is_empty());
    }

    #[test]
    fn test_send_without_peers_is_noop() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        link.send(&Telemetry::Heading(12.0));
    }

    #[test]
    fn test_loopback() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        let addr = link.local_addr().unwrap();
        let client = client();

        client.send_to(&[0xff], addr).unwrap();
        client.send_to(&[0x0a, 1], addr).unwrap();

        let received = poll_until(&link, 2);
        assert_eq!(received, vec![vec![0xff], vec![0x0a, 1]]);
        assert_eq!(link.peers(), vec![client.local_addr().unwrap()]);

        link.send(&Telemetry::Heading(90.0));
        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(Telemetry::decode(&buf[..len]).unwrap(), Telemetry::Heading(90.0));
    }

    #[test]
    fn test_peers_are_capped() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        let addr = link.local_addr().unwrap();

        let clients: Vec<UdpSocket> = (0..MAX_PEERS + 1).map(|_| client()).collect();
        for client in &clients {
            client.send_to(&[0xff], addr).unwrap();
        }
        poll_until(&link, MAX_PEERS + 1);

        assert_eq!(link.peers().len(), MAX_PEERS);
        assert_eq!(link.take_joined().len(), MAX_PEERS + 1);
        assert!(link.take_joined().is_empty());
    }

    #[test]
    fn test_newcomer_evicts_quietest_peer() {
        let start = Instant::now();
        let addr = |port: u16| SocketAddr::from(([127, 0, 0, 1], port));
        let mut peers = Peers::default();

        for port in 0..MAX_PEERS as u16 {
            peers.seen(addr(9000 + port), start + Duration::from_millis(port as u64));
        }
        // the first client is still talking
        peers.seen(addr(9000), start + Duration::from_millis(100));
        peers.seen(addr(9100), start + Duration::from_millis(200));

        let active: Vec<SocketAddr> = peers.active.iter().map(|p| p.addr).collect();
        assert_eq!(active.len(), MAX_PEERS);
        assert!(active.contains(&addr(9100)));
        assert!(active.contains(&addr(9000)));
        assert!(!active.contains(&addr(9001)));
    }

    #[test]
    fn test_silent_peers_expire() {
        let start = Instant::now();
        let mut peers = Peers::default();
        peers.seen(SocketAddr::from(([127, 0, 0, 1], 9000)), start);
        peers.seen(SocketAddr::from(([127, 0, 0, 1], 9001)), start + PEER_TIMEOUT / 2);

        peers.expire(start + PEER_TIMEOUT);
        assert_eq!(peers.active.len(), 1);
        assert_eq!(peers.active[0].addr.port(), 9001);
    }

    #[test]
    fn test_client_reconnecting_after_full_house_gets_telemetry() {
        let link = UdpLink::bind("127.0.0.1:0").unwrap();
        let addr = link.local_addr().unwrap();

        for _ in 0..MAX_PEERS {
            let gone = client();
            gone.send_to(&[0xff], addr).unwrap();
            poll_until(&link, 1);
        }

        let fresh = client();
        fresh.send_to(&[0xff], addr).unwrap();
        poll_until(&link, 1);
        assert!(link.peers().contains(&fresh.local_addr().unwrap()));

        link.send(&Telemetry::Heading(45.0));
        let mut buf = [0u8; 64];
        let (len, _) = fresh.recv_from(&mut buf).unwrap();
        assert_eq!(Telemetry::decode(&buf[..len]).unwrap(), Telemetry::Heading(45.0));
    }
}
