use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use relay_core::{
    CardInfo, ControlWord, EcmRequest, EmmPacket, Event, RelayError, RelayResult, StopReason, net,
};

use crate::config::{ClientConfig, LinkKind};
use crate::crypto::Credential;
use crate::emm::{EMM_REQUEST_LEN, parse_emm_request};
use crate::frame::{Command, Frame, open, seal};
use crate::link::{DatagramLink, Link, StreamLink};

/**
    Global session counter for log correlation, shared by client and
    server sessions.
*/
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_number() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/**
    Requests with the same key are suppressed after a stop command.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub service_id: u16,
    pub caid: u16,
    pub pid: u16,
}

impl From<&EcmRequest> for FlowKey {
    fn from(request: &EcmRequest) -> Self {
        Self {
            service_id: request.service_id,
            caid: request.caid,
            pid: request.pid,
        }
    }
}

/**
    A camd 3.5x client session over UDP (camd35) or TCP (cs378x).

    There is no login exchange: every frame carries the user CRC and is
    sealed with the password key, so the server only proves itself by
    answering with frames that decrypt.
*/
pub struct Session<L: Link = Box<dyn Link + Send>> {
    number: u64,
    link: L,
    credential: Credential,
    /// Key of the last request sent; a stop command applies to it.
    last_sent: Option<FlowKey>,
    stopped: Option<(FlowKey, StopReason)>,
    card: Option<CardInfo>,
    closed: bool,
}

impl Session {
    /**
        Open a client link to `host:port` with the configured transport.
    */
    pub fn open(host: &str, port: u16, config: ClientConfig) -> RelayResult<Self> {
        config.validate()?;
        let link: Box<dyn Link + Send> = match config.transport {
            LinkKind::Tcp => {
                let stream = net::connect(host, port, config.connect_timeout)?;
                stream.set_read_timeout(config.read_timeout)?;
                Box::new(StreamLink::new(stream))
            }
            LinkKind::Udp => {
                let peer = net::resolve(host, port)?;
                let local: SocketAddr = if peer.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local)?;
                socket.set_read_timeout(config.read_timeout)?;
                Box::new(DatagramLink::connect(socket, peer)?)
            }
        };
        Self::connect(link, &config)
    }
}

impl<L: Link> Session<L> {
    pub fn connect(link: L, config: &ClientConfig) -> RelayResult<Self> {
        config.validate()?;
        let session = Self {
            number: next_session_number(),
            link,
            credential: config.credential(),
            last_sent: None,
            stopped: None,
            card: None,
            closed: false,
        };
        info!(
            session = session.number,
            user = %config.username,
            transport = ?config.transport,
            ucrc = %hex::encode(session.credential.ucrc()),
            "session opened"
        );
        Ok(session)
    }

    /**
        Send an ECM request.

        Fails with `Stopped` while the server has asked to stop requests
        for the same service, caid and pid. Asking for anything else lifts
        the stop.
    */
    pub fn send_request(&mut self, request: &EcmRequest) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::PeerClosed);
        }

        let key = FlowKey::from(request);
        if let Some((stopped, reason)) = self.stopped {
            if stopped == key {
                debug!(session = self.number, ?key, %reason, "request suppressed");
                return Err(RelayError::Stopped(reason));
            }
            self.stopped = None;
        }

        let mut frame = Frame::with_len(Command::Ecm, request.payload_len()?);
        frame.set_service_id(request.service_id);
        frame.set_caid(request.caid);
        frame.set_provider_id(request.provider_id);
        frame.set_index(request.index);
        frame.set_request_marker();
        frame.set_body(&request.payload);

        debug!(session = self.number, ?frame, "sending ecm");
        self.send(&frame)?;
        self.last_sent = Some(key);
        Ok(())
    }

    /**
        Forward an EMM to the server's card.
    */
    pub fn send_emm(&mut self, emm: &EmmPacket) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::PeerClosed);
        }
        let len = u8::try_from(emm.payload.len()).map_err(|_| RelayError::MessageTooLarge {
            size: emm.payload.len(),
            max: u8::MAX as usize,
        })?;

        let mut frame = Frame::with_len(Command::Emm, len);
        frame.set_caid(emm.caid);
        frame.set_provider_id(u32::from_be_bytes(emm.provider_id));
        frame.set_body(&emm.payload);

        debug!(session = self.number, ?frame, "sending emm");
        self.send(&frame)
    }

    /**
        Read and handle one frame.

        Returns `Event::PeerClosed` the first time the server closes the
        connection; any later call fails with `RelayError::PeerClosed`.
    */
    pub fn receive(&mut self) -> RelayResult<Event> {
        if self.closed {
            return Err(RelayError::PeerClosed);
        }

        let raw = match self.link.recv_frame(&mut self.credential) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(session = self.number, "server closed the connection");
                self.closed = true;
                return Ok(Event::PeerClosed);
            }
            Err(e) => return Err(self.fail(e)),
        };

        let result = open(&raw, &mut self.credential).and_then(|frame| self.dispatch(&frame));
        result.map_err(|e| self.fail(e))
    }

    pub fn close(&mut self) {
        self.link.shutdown();
        self.closed = true;
        info!(session = self.number, "session closed");
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /**
        Card the server described in its last card data frame.
    */
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn stopped(&self) -> Option<(FlowKey, StopReason)> {
        self.stopped
    }

    fn send<B: AsRef<[u8]>>(&mut self, frame: &Frame<B>) -> RelayResult<()> {
        let raw = seal(frame, &self.credential);
        self.link.send_frame(&raw).map_err(|e| self.fail(e))
    }

    fn fail(&mut self, e: RelayError) -> RelayError {
        if e.is_fatal() {
            warn!(session = self.number, error = %e, "session failed");
            self.link.shutdown();
            self.closed = true;
        } else {
            debug!(session = self.number, error = %e, "frame dropped");
        }
        e
    }

    fn dispatch(&mut self, frame: &Frame) -> RelayResult<Event> {
        let index = frame.index();
        let Some(command) = Command::from_u8(frame.command()) else {
            debug!(session = self.number, command = frame.command(), "unknown command");
            return Ok(Event::Ignored);
        };
        debug!(session = self.number, %command, len = frame.len(), "recv");

        match command {
            Command::Cw | Command::CascadeCw => {
                let body = frame.body();
                if body.len() < 16 {
                    return Err(RelayError::ShortRead {
                        expected: 16,
                        actual: body.len(),
                    });
                }
                let mut cw = [0u8; 16];
                cw.copy_from_slice(&body[..16]);
                let cw = ControlWord(cw);
                debug!(session = self.number, index, %cw, "control word");
                Ok(Event::ControlWord { index, cw })
            }
            Command::Reject => {
                info!(session = self.number, index, "request rejected");
                Ok(Event::Rejected { index })
            }
            Command::Stop => {
                let reason = match frame.body().get(1) {
                    Some(0xFF) => StopReason::Sleep,
                    _ => StopReason::Invalid,
                };
                warn!(
                    session = self.number,
                    index,
                    sid = %format_args!("{:04X}", frame.service_id()),
                    %reason,
                    "server stopped requests"
                );
                self.stopped = self.last_sent.map(|key| (key, reason));
                Ok(Event::Stopped { index, reason })
            }
            Command::EmmRequest if frame.len() == EMM_REQUEST_LEN => {
                let card = parse_emm_request(frame)?;
                info!(
                    session = self.number,
                    caid = %format_args!("{:04X}", card.caid),
                    serial = %hex::encode(card.serial),
                    providers = card.providers.len(),
                    "card data"
                );
                self.card = Some(card.clone());
                Ok(Event::CardInfo(card))
            }
            _ => Ok(Event::Ignored),
        }
    }
}
