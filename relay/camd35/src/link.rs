use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use tracing::debug;

use relay_core::utils::read_full;
use relay_core::{RelayError, RelayResult, Transport, boundary};

use crate::crypto::{FrameCipher, Keyring};
use crate::frame::frame_len;

/// Largest datagram accepted on the UDP transport.
const DATAGRAM_LEN: usize = 1024;

/**
    Carries sealed frames between two peers.

    `recv_frame` returns the sealed bytes of exactly one frame, or `None`
    once the peer has closed the connection. Decrypting and checking the
    frame is left to [`crate::frame::open`].
*/
pub trait Link {
    fn send_frame(&mut self, raw: &[u8]) -> RelayResult<()>;

    fn recv_frame(&mut self, keyring: &mut dyn Keyring) -> RelayResult<Option<Vec<u8>>>;

    fn shutdown(&mut self) {}
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn send_frame(&mut self, raw: &[u8]) -> RelayResult<()> {
        (**self).send_frame(raw)
    }

    fn recv_frame(&mut self, keyring: &mut dyn Keyring) -> RelayResult<Option<Vec<u8>>> {
        (**self).recv_frame(keyring)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/**
    TCP transport (cs378x).

    The stream has no message boundaries, so the receiver checks the user
    CRC, decrypts a copy of the first block to learn the declared length
    and then pulls the rest of the frame.
*/
pub struct StreamLink<S: Transport = TcpStream> {
    stream: S,
}

impl<S: Transport> StreamLink<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /**
        Fill `buf`, returning `false` if the peer closed before the first byte.
    */
    fn read_start(&mut self, buf: &mut [u8]) -> RelayResult<bool> {
        let n = loop {
            match self.stream.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::from_read(e, buf.len(), 0)),
            }
        };
        if n == 0 {
            return Ok(false);
        }
        if n < buf.len() {
            read_full(&mut self.stream, &mut buf[n..]).map_err(RelayError::mid_frame)?;
        }
        Ok(true)
    }
}

impl<S: Transport> Link for StreamLink<S> {
    fn send_frame(&mut self, raw: &[u8]) -> RelayResult<()> {
        self.stream.write_all(raw)?;
        Ok(())
    }

    fn recv_frame(&mut self, keyring: &mut dyn Keyring) -> RelayResult<Option<Vec<u8>>> {
        let mut raw = vec![0u8; 4];
        if !self.read_start(&mut raw)? {
            return Ok(None);
        }
        let cipher = keyring.cipher_for([raw[0], raw[1], raw[2], raw[3]])?;

        raw.resize(4 + 2 * FrameCipher::BLOCK_LEN, 0);
        read_full(&mut self.stream, &mut raw[4..]).map_err(RelayError::mid_frame)?;

        let mut first = [0u8; FrameCipher::BLOCK_LEN];
        first.copy_from_slice(&raw[4..4 + FrameCipher::BLOCK_LEN]);
        cipher.decrypt(&mut first);

        let sealed = boundary(FrameCipher::BLOCK_LEN, frame_len(first[0], first[1]));
        if 4 + sealed > raw.len() {
            let have = raw.len();
            raw.resize(4 + sealed, 0);
            read_full(&mut self.stream, &mut raw[have..]).map_err(RelayError::mid_frame)?;
        }
        Ok(Some(raw))
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown() {
            debug!(error = %e, "shutdown failed");
        }
    }
}

/**
    UDP transport (camd35): one datagram is one frame.

    A client link is connected to its server. A server link is bound only
    and answers whoever sent the last datagram.
*/
pub struct DatagramLink {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    connected: bool,
}

impl DatagramLink {
    pub fn connect(socket: UdpSocket, peer: SocketAddr) -> RelayResult<Self> {
        socket.connect(peer)?;
        Ok(Self {
            socket,
            peer: Some(peer),
            connected: true,
        })
    }

    pub fn bound(socket: UdpSocket) -> Self {
        Self {
            socket,
            peer: None,
            connected: false,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Link for DatagramLink {
    fn send_frame(&mut self, raw: &[u8]) -> RelayResult<()> {
        if self.connected {
            self.socket.send(raw)?;
            return Ok(());
        }
        let peer = self
            .peer
            .ok_or_else(|| RelayError::Io("no peer to answer".into()))?;
        self.socket.send_to(raw, peer)?;
        Ok(())
    }

    fn recv_frame(&mut self, _keyring: &mut dyn Keyring) -> RelayResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; DATAGRAM_LEN];
        let (n, from) = loop {
            match self.socket.recv_from(&mut buf) {
                Ok(received) => break received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::from_read(e, DATAGRAM_LEN, 0)),
            }
        };
        if !self.connected && self.peer != Some(from) {
            debug!(peer = %from, "new peer");
            self.peer = Some(from);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}
