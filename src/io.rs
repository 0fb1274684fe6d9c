//! Datagram I/O: owns the listen sockets (game+ping pairs) and one outbound
//! client socket, and performs blocking multi-socket readiness wait for the
//! receive worker.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::config::ListenConfig;

/// Largest possible UDP payload; the receive buffer is sized to it.
pub const MAX_UDP_PAYLOAD: usize = 65_527;

/// Datagrams larger than this are rejected outright as malicious, except
/// connection-init packets.
pub const GAME_PACKET_REJECT_LIMIT: usize = crate::wire::GAME_PACKET_LIMIT;

const TOKEN_OUTBOUND: Token = Token(usize::MAX);

/// One bound `{game socket, ping socket}` pair plus its configuration.
pub struct Listen {
    pub config: ListenConfig,
    pub game_socket: UdpSocket,
    pub ping_socket: UdpSocket,
}

/// Which socket a readiness event or received datagram belongs to.
pub enum SocketKind {
    /// `listens[index]`'s game socket.
    Game(usize),
    /// `listens[index]`'s ping socket.
    Ping(usize),
    /// The single outbound client socket.
    Outbound,
}

/// Owns every bound socket and waits for readiness across all of them with
/// ≤1s granularity.
pub struct DatagramIo {
    poll: Poll,
    pub listens: Vec<Listen>,
    pub outbound_socket: Option<UdpSocket>,
    events: Events,
}

impl DatagramIo {
    /// Binds one game+ping socket pair per `configs` entry, plus (if
    /// `internal_client_port != 0`) the outbound client socket.
    pub fn bind(configs: &[ListenConfig], internal_client_port: u16) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listens = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            let game_addr = SocketAddr::new(config.bind_address, config.port);
            let ping_addr = SocketAddr::new(config.bind_address, config.ping_port());

            let mut game_socket = UdpSocket::bind(game_addr)?;
            let mut ping_socket = UdpSocket::bind(ping_addr)?;

            poll.registry()
                .register(&mut game_socket, Token(index * 2), Interest::READABLE)?;
            poll.registry()
                .register(&mut ping_socket, Token(index * 2 + 1), Interest::READABLE)?;

            listens.push(Listen {
                config: config.clone(),
                game_socket,
                ping_socket,
            });
        }

        let outbound_socket = if internal_client_port != 0 {
            let addr = SocketAddr::new([0, 0, 0, 0].into(), internal_client_port);
            let mut socket = UdpSocket::bind(addr)?;
            poll.registry()
                .register(&mut socket, TOKEN_OUTBOUND, Interest::READABLE)?;
            Some(socket)
        } else {
            None
        };

        Ok(Self {
            poll,
            listens,
            outbound_socket,
            events: Events::with_capacity(128),
        })
    }

    /// Waits up to `timeout` (capped at 1s) for any socket to become readable,
    /// returning the sockets that are.
    pub fn poll_readable(&mut self, timeout: Duration) -> io::Result<Vec<SocketKind>> {
        let timeout = timeout.min(Duration::from_secs(1));
        self.poll.poll(&mut self.events, Some(timeout))?;

        let mut ready = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                TOKEN_OUTBOUND => ready.push(SocketKind::Outbound),
                Token(t) if t % 2 == 0 => ready.push(SocketKind::Game(t / 2)),
                Token(t) => ready.push(SocketKind::Ping(t / 2)),
            }
        }
        Ok(ready)
    }

    /// Unencrypted send, bypassing any connection's encryptor; used for
    /// connection-init responses.
    pub fn really_raw_send(&self, listen_index: usize, remote: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.listens[listen_index].game_socket.send_to(bytes, remote)
    }
}

/// A plain blocking socket wrapper for the send worker, which issues sends from
/// a dedicated thread rather than through the mio poll loop.
pub struct SendSocket {
    inner: StdUdpSocket,
}

impl SendSocket {
    pub fn from_listen_port(bind_address: std::net::IpAddr, port: u16) -> io::Result<Self> {
        let inner = StdUdpSocket::bind(SocketAddr::new(bind_address, port))?;
        Ok(Self { inner })
    }

    pub fn send_to(&self, bytes: &[u8], remote: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(bytes, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;

    fn local_listen(port: u16) -> ListenConfig {
        ListenConfig {
            port,
            bind_address: "127.0.0.1".parse().unwrap(),
            connect_as: "zone".into(),
            allow_vie: true,
            allow_cont: true,
        }
    }

    #[test]
    fn binds_game_and_ping_sockets() {
        let configs = vec![local_listen(0)];
        let io = DatagramIo::bind(&configs, 0).unwrap();
        assert_eq!(io.listens.len(), 1);
        assert!(io.outbound_socket.is_none());
    }

    #[test]
    fn really_raw_send_reaches_a_local_peer() {
        let configs = vec![local_listen(0)];
        let io = DatagramIo::bind(&configs, 0).unwrap();
        let local_addr = io.listens[0].game_socket.local_addr().unwrap();
        let sent = io.really_raw_send(0, local_addr, b"ping");
        assert!(sent.is_ok());
    }
}
