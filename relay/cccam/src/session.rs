use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use relay_core::utils::{copy_truncated, read_full};
use relay_core::{
    ControlWord, EcmRequest, Event, Registry, RelayError, RelayResult, Transport, net,
};

use crate::card::{self, Card};
use crate::config::ClientConfig;
use crate::constants::{ACK_LEN, HANDSHAKE_TAG, SEED_LEN, USERNAME_LEN};
use crate::crypto::{CipherState, decode_cw, derive_keys};
use crate::message::{self, Header, MessageType, ServerData};
use crate::node_id::NodeIdGenerator;

/**
    Global session counter for log correlation.
*/
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/**
    Connection lifecycle of a [`Session`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingServerSeed,
    Handshaking,
    Running,
    Closed,
}

/**
    A CCcam client session.

    One instance owns one connection and both cipher directions. The card
    list is shared (see [`Session::cards`]) so that routing lookups from
    another thread see advertisements as they arrive.
*/
pub struct Session<S: Transport = TcpStream> {
    number: u64,
    stream: S,
    state: SessionState,
    config: ClientConfig,
    send: CipherState,
    recv: CipherState,
    node_id: [u8; 8],
    server: Option<ServerData>,
    last_cw: Option<ControlWord>,
    /// Card the last request was routed to; control words are decoded with its id.
    selected: Option<u32>,
    cards: Arc<Registry<Card>>,
    /// Index of the last request sent, echoed in the resulting event.
    request_index: u16,
}

impl Session<TcpStream> {
    /**
        Connect to `host:port` and log in.
    */
    pub fn open(host: &str, port: u16, config: ClientConfig) -> RelayResult<Self> {
        config.validate()?;
        let stream = net::connect(host, port, config.connect_timeout)?;
        stream.set_read_timeout(config.read_timeout)?;
        Self::connect(stream, config)
    }
}

impl<S: Transport> Session<S> {
    /**
        Log in over an already connected stream.
    */
    pub fn connect(stream: S, config: ClientConfig) -> RelayResult<Self> {
        config.validate()?;
        let mut session = Self::new(stream, config);
        session.handshake()?;
        Ok(session)
    }

    fn new(stream: S, config: ClientConfig) -> Self {
        let node_id = config
            .node_id
            .unwrap_or_else(|| NodeIdGenerator::from_clock().node_id());
        Self {
            number: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            stream,
            state: SessionState::Disconnected,
            config,
            send: CipherState::new(&[]),
            recv: CipherState::new(&[]),
            node_id,
            server: None,
            last_cw: None,
            selected: None,
            cards: Arc::new(Registry::new()),
            request_index: 0,
        }
    }

    fn handshake(&mut self) -> RelayResult<()> {
        let result = self.login();
        if let Err(e) = &result {
            warn!(session = self.number, error = %e, "login failed");
            self.state = SessionState::Disconnected;
        }
        result
    }

    fn login(&mut self) -> RelayResult<()> {
        self.state = SessionState::AwaitingServerSeed;
        let mut seed = [0u8; SEED_LEN];
        read_full(&mut self.stream, &mut seed)?;
        debug!(session = self.number, seed = %hex::encode(seed), "received seed");

        self.state = SessionState::Handshaking;
        let keys = derive_keys(&seed);
        self.recv = keys.recv;
        self.send = keys.send;
        self.write_raw(&keys.digest)?;

        let mut username = [0u8; USERNAME_LEN];
        copy_truncated(&mut username, self.config.username.as_bytes());
        self.write_raw(&username)?;

        // The password is never sent; it only advances the outbound keystream.
        let mut password = self.config.password.clone().into_bytes();
        self.send.encrypt(&mut password);

        self.write_raw(HANDSHAKE_TAG)?;

        let mut ack = [0u8; ACK_LEN];
        read_full(&mut self.stream, &mut ack)?;
        self.recv.decrypt(&mut ack);
        if ack[..5] != HANDSHAKE_TAG[..5] {
            return Err(RelayError::AuthRejected);
        }
        info!(session = self.number, user = %self.config.username, "login succeeded");

        let body = message::client_data(
            &self.config.username,
            &self.node_id,
            &self.config.version,
            &self.config.build,
        );
        self.send_message(MessageType::ClientData, &body)?;
        self.state = SessionState::Running;
        Ok(())
    }

    /**
        Read and handle one message.

        Returns `Event::PeerClosed` the first time the server closes the
        connection; any later call fails with `RelayError::PeerClosed`.
        Errors for a single malformed message leave the session running.
    */
    pub fn receive(&mut self) -> RelayResult<Event> {
        if self.state != SessionState::Running {
            return Err(RelayError::PeerClosed);
        }

        let result = match self.read_message() {
            Ok(None) => {
                info!(session = self.number, "server closed the connection");
                self.reset();
                return Ok(Event::PeerClosed);
            }
            Ok(Some((header, mut body))) => self.dispatch(header, &mut body),
            Err(e) => Err(e),
        };
        result.map_err(|e| self.fail(e))
    }

    /**
        Route `request` to the first eligible card and send it.

        Fails with `NoEligibleCard` when no hop-0 card serves the caid and
        provider; nothing is sent and the session is left as it was.
    */
    pub fn send_request(&mut self, request: &EcmRequest) -> RelayResult<()> {
        if self.state != SessionState::Running {
            return Err(RelayError::PeerClosed);
        }

        let Some(route) = card::select_card(&self.cards, request) else {
            info!(
                session = self.number,
                caid = %format_args!("{:04X}", request.caid),
                provider = %format_args!("{:06X}", request.provider_id),
                "no suitable card"
            );
            return Err(RelayError::NoEligibleCard {
                caid: request.caid,
                provider_id: request.provider_id,
            });
        };

        let body = message::ecm_body(route.caid, route.card_id, request)?;
        self.selected = Some(route.card_id);
        self.request_index = request.index;

        info!(
            session = self.number,
            sid = %format_args!("{:04X}", request.service_id),
            card = %format_args!("{:08X}", route.card_id),
            hop = route.hop,
            "sending ecm"
        );
        self.send_message(MessageType::Ecm, &body)
            .map_err(|e| self.fail(e))
    }

    /**
        Stop routing `service_id` to the currently selected card.
    */
    pub fn mark_service_failed(&mut self, service_id: u16) {
        if let Some(card_id) = self.selected {
            card::with_card(&self.cards, card_id, |card| card.mark_failed(service_id));
        }
    }

    /**
        Shut the connection down and drop every card.
    */
    pub fn close(&mut self) {
        if let Err(e) = self.stream.shutdown() {
            debug!(session = self.number, error = %e, "shutdown failed");
        }
        self.cards.clear();
        self.selected = None;
        self.state = SessionState::Closed;
        info!(session = self.number, "session closed");
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn node_id(&self) -> &[u8; 8] {
        &self.node_id
    }

    pub fn server_data(&self) -> Option<&ServerData> {
        self.server.as_ref()
    }

    pub fn last_cw(&self) -> Option<ControlWord> {
        self.last_cw
    }

    pub fn selected_card(&self) -> Option<u32> {
        self.selected
    }

    /**
        Shared handle to the card list.
    */
    pub fn cards(&self) -> Arc<Registry<Card>> {
        Arc::clone(&self.cards)
    }

    fn write_raw(&mut self, data: &[u8]) -> RelayResult<()> {
        let mut buf = data.to_vec();
        self.send.encrypt(&mut buf);
        io::Write::write_all(&mut self.stream, &buf)?;
        Ok(())
    }

    fn send_message(&mut self, command: MessageType, body: &[u8]) -> RelayResult<()> {
        let buf = message::encode(command, body)?;
        debug!(session = self.number, %command, len = body.len(), "send");
        self.write_raw(&buf)
    }

    /**
        Read one header and its body. `None` means the peer closed the
        connection before sending anything.
    */
    fn read_message(&mut self) -> RelayResult<Option<(Header, Vec<u8>)>> {
        let mut raw = [0u8; Header::LEN];
        let n = loop {
            match self.stream.read(&mut raw) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::from_read(e, Header::LEN, 0)),
            }
        };
        if n == 0 {
            return Ok(None);
        }
        if n < Header::LEN {
            read_full(&mut self.stream, &mut raw[n..]).map_err(|e| match e {
                RelayError::ShortRead { actual, .. } => RelayError::ShortRead {
                    expected: Header::LEN,
                    actual: n + actual,
                },
                other => other.mid_frame(),
            })?;
        }

        self.recv.decrypt(&mut raw);
        let header = Header::from_bytes(&raw);
        let len = header.body_len()?;

        let mut body = vec![0u8; len];
        read_full(&mut self.stream, &mut body).map_err(RelayError::mid_frame)?;
        self.recv.decrypt(&mut body);
        Ok(Some((header, body)))
    }

    fn dispatch(&mut self, header: Header, body: &mut [u8]) -> RelayResult<Event> {
        let Some(command) = MessageType::from_u8(header.command) else {
            debug!(session = self.number, command = header.command, "unknown message");
            return Ok(Event::Ignored);
        };
        debug!(session = self.number, %command, len = body.len(), "recv");

        match command {
            MessageType::ClientData => {
                debug!(session = self.number, "client data acknowledged");
                Ok(Event::Ignored)
            }
            MessageType::ServerData => {
                let data = ServerData::parse(body)?;
                info!(
                    session = self.number,
                    node_id = %hex::encode(data.node_id),
                    version = %data.version,
                    build = %data.build,
                    "server data"
                );
                self.server = Some(data);
                Ok(Event::Ignored)
            }
            MessageType::NewCard => self.add_card(body),
            MessageType::CardRemoved => self.drop_card(body),
            MessageType::CwNok1 | MessageType::CwNok2 => {
                info!(session = self.number, index = self.request_index, "cw nok");
                Ok(Event::Rejected {
                    index: self.request_index,
                })
            }
            MessageType::Ecm => self.control_word(body),
            MessageType::Ping => {
                self.send_message(MessageType::Ping, &[])?;
                Ok(Event::KeepaliveHandled)
            }
            MessageType::DcwSomething => Ok(Event::Ignored),
        }
    }

    fn add_card(&mut self, body: &[u8]) -> RelayResult<Event> {
        let card = Card::parse(body)?;
        if !self.config.accepts_caid(card.caid) {
            debug!(
                session = self.number,
                caid = %format_args!("{:04X}", card.caid),
                "card filtered out"
            );
            return Ok(Event::Ignored);
        }

        info!(
            session = self.number,
            card = %format_args!("{:08X}", card.id),
            caid = %format_args!("{:04X}", card.caid),
            hop = card.hop,
            serial = %hex::encode(card.serial),
            providers = ?card.providers(),
            "card added"
        );
        let id = card.id;
        self.cards.append(card);
        if self.selected.is_none() {
            self.selected = Some(id);
        }
        Ok(Event::Ignored)
    }

    fn drop_card(&mut self, body: &[u8]) -> RelayResult<Event> {
        let id = message::removed_card_id(body)?;
        match card::remove_card(&self.cards, id) {
            Some(card) => {
                info!(
                    session = self.number,
                    card = %format_args!("{:08X}", card.id),
                    caid = %format_args!("{:04X}", card.caid),
                    "card removed"
                );
                if self.selected == Some(id) {
                    self.selected = None;
                }
            }
            None => debug!(session = self.number, card = id, "removal of unknown card"),
        }
        Ok(Event::Ignored)
    }

    fn control_word(&mut self, body: &mut [u8]) -> RelayResult<Event> {
        let event = match (self.selected, body.len() >= 16) {
            (Some(card_id), true) => {
                let mut cw = [0u8; 16];
                cw.copy_from_slice(&body[..16]);
                decode_cw(&mut cw, &self.node_id, card_id);
                body[..16].copy_from_slice(&cw);

                let cw = ControlWord(cw);
                debug!(session = self.number, %cw, "control word");
                self.last_cw = Some(cw);
                Ok(Event::ControlWord {
                    index: self.request_index,
                    cw,
                })
            }
            (None, _) => {
                warn!(session = self.number, "control word without a selected card");
                Ok(Event::Ignored)
            }
            (Some(_), false) => Err(RelayError::ShortRead {
                expected: 16,
                actual: body.len(),
            }),
        };

        // The server advances its outbound state over the decoded body as well.
        self.recv.encrypt(body);
        event
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        if err.is_fatal() {
            warn!(session = self.number, error = %err, "connection lost");
            self.reset();
        } else {
            warn!(session = self.number, error = %err, "message dropped");
        }
        err
    }

    fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.selected = None;
        self.cards.clear();
    }
}
