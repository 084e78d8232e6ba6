use std::time::Instant;

use tracing::{debug, info, warn};

use relay_core::{CardInfo, ControlWord, EcmRequest, EmmPacket, RelayError, RelayResult};

use crate::config::ServerConfig;
use crate::crypto::{Credential, FrameCipher, Keyring};
use crate::emm::{EMM_REQUEST_LEN_LEGACY, EmmThrottle, build_emm_request};
use crate::frame::{Command, HEADER_LEN, TRAILER_LEN, open, seal};
use crate::link::Link;
use crate::session::next_session_number;
use crate::slots::RequestSlots;

/**
    Accounts a server session accepts.

    The first frame picks the account by its user CRC. After that the
    session is bound to it and frames for any other account are refused.
*/
#[derive(Debug)]
struct Accounts {
    list: Vec<Credential>,
    active: Option<usize>,
}

impl Accounts {
    fn active(&self) -> Option<&Credential> {
        self.active.map(|i| &self.list[i])
    }
}

impl Keyring for Accounts {
    fn cipher_for(&mut self, ucrc: [u8; 4]) -> RelayResult<&FrameCipher> {
        let at = match self.active {
            Some(i) if self.list[i].ucrc() == ucrc => i,
            Some(_) => return Err(RelayError::UnknownUser),
            None => {
                let i = self
                    .list
                    .iter()
                    .position(|c| c.ucrc() == ucrc)
                    .ok_or(RelayError::UnknownUser)?;
                info!(user = %self.list[i].username(), "account matched");
                self.active = Some(i);
                i
            }
        };
        Ok(self.list[at].cipher())
    }
}

/**
    What a client asked for.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// An ECM, stored in the slot given by `index`.
    Ecm(EcmRequest),
    Emm(EmmPacket),
    /// A frame that needs no answer.
    Ignored,
    PeerClosed,
}

/**
    How a stored request is answered.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Found(ControlWord),
    NotFound,
    /// The request can never be served.
    Invalid,
    /// The reader is temporarily unavailable.
    Sleep,
}

/**
    Server side of one camd 3.5x peer.

    Requests are stored in a slot pool owned by the caller and answered
    later by rewriting the same slot, so the routing fields the client
    wrote come back unchanged.
*/
pub struct ServerSession<L: Link = Box<dyn Link + Send>> {
    number: u64,
    link: L,
    accounts: Accounts,
    suppress_cmd08: bool,
    /// Card announced to the client. `None` disables provisioning.
    au_card: Option<CardInfo>,
    throttle: EmmThrottle,
    closed: bool,
}

impl<L: Link> ServerSession<L> {
    pub fn new(link: L, config: &ServerConfig) -> RelayResult<Self> {
        config.validate()?;
        Ok(Self {
            number: next_session_number(),
            link,
            accounts: Accounts {
                list: config.accounts.clone(),
                active: None,
            },
            suppress_cmd08: config.suppress_cmd08,
            au_card: None,
            throttle: EmmThrottle::new(),
            closed: false,
        })
    }

    /**
        Read one frame. An ECM is copied into `slots` at `slot` and
        reported with `index` set to `slot`; the client's own index is
        reported as the pid.
    */
    pub fn receive(&mut self, slots: &mut RequestSlots, slot: u16) -> RelayResult<Request> {
        if self.closed {
            return Err(RelayError::PeerClosed);
        }

        let raw = match self.link.recv_frame(&mut self.accounts) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(session = self.number, "client closed the connection");
                self.closed = true;
                return Ok(Request::PeerClosed);
            }
            Err(e) => return Err(self.fail(e)),
        };
        let frame = open(&raw, &mut self.accounts).map_err(|e| self.fail(e))?;

        let Some(command) = Command::from_u8(frame.command()) else {
            debug!(session = self.number, command = frame.command(), "unknown command");
            return Ok(Request::Ignored);
        };
        debug!(session = self.number, %command, ?frame, "recv");

        match command {
            Command::Ecm | Command::CascadeEcm => {
                slots.store(slot, frame.as_bytes());
                Ok(Request::Ecm(EcmRequest {
                    caid: frame.caid(),
                    provider_id: frame.provider_id(),
                    service_id: frame.service_id(),
                    pid: frame.index(),
                    index: slot,
                    payload: frame.body().to_vec(),
                }))
            }
            Command::Emm | Command::Emm19 => Ok(Request::Emm(EmmPacket {
                caid: frame.caid(),
                provider_id: frame.provider_bytes(),
                payload: frame.body().to_vec(),
            })),
            _ => Ok(Request::Ignored),
        }
    }

    /**
        Answer the request stored at `index` and follow up with card data
        when it is due.
    */
    pub fn send_dcw(
        &mut self,
        slots: &mut RequestSlots,
        index: u16,
        answer: Answer,
    ) -> RelayResult<()> {
        if self.closed {
            return Err(RelayError::PeerClosed);
        }
        let credential = self.accounts.active().ok_or(RelayError::UnknownUser)?;

        let mut frame = slots.slot_mut(index);
        match answer {
            Answer::Found(cw) => {
                let cascading = Command::has_trailer(frame.command());
                if cascading {
                    let start = HEADER_LEN + frame.len() as usize;
                    frame
                        .raw_mut()
                        .copy_within(start..start + TRAILER_LEN, HEADER_LEN + 16);
                }
                frame.set_command(if cascading {
                    Command::CascadeCw
                } else {
                    Command::Cw
                });
                frame.set_body(cw.as_bytes());
            }
            Answer::Invalid if !self.suppress_cmd08 => {
                frame.set_command(Command::Stop);
                frame.set_body(&[0, 0]);
            }
            Answer::Sleep => {
                frame.set_command(Command::Stop);
                frame.set_body(&[0, 0xFF]);
            }
            Answer::Invalid | Answer::NotFound => {
                frame.set_command(Command::Reject);
                frame.set_len(0);
            }
        }
        debug!(session = self.number, ?answer, ?frame, "answer");

        let raw = seal(&frame, credential);
        let (service_id, provider_id, pid) =
            (frame.service_id(), frame.provider_id(), frame.index());
        self.link.send_frame(&raw).map_err(|e| self.fail(e))?;

        self.provision(service_id, provider_id, pid)
    }

    /**
        Card announced to the client after each answer.
    */
    pub fn set_au_card(&mut self, card: CardInfo) {
        self.au_card = Some(card);
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /**
        Account the client authenticated as.
    */
    pub fn username(&self) -> Option<&str> {
        self.accounts.active().map(Credential::username)
    }

    pub fn close(&mut self) {
        self.link.shutdown();
        self.closed = true;
        info!(session = self.number, "session closed");
    }

    fn provision(&mut self, service_id: u16, provider_id: u32, pid: u16) -> RelayResult<()> {
        let Some(card) = &self.au_card else {
            return Ok(());
        };
        if !self.throttle.admit(card, Instant::now()) {
            return Ok(());
        }
        let credential = self.accounts.active().ok_or(RelayError::UnknownUser)?;

        info!(
            session = self.number,
            caid = %format_args!("{:04X}", card.caid),
            serial = %hex::encode(card.serial),
            "sending card data"
        );
        let mut frame = build_emm_request(card, service_id, provider_id, pid);
        let current = seal(&frame, credential);
        frame.set_len(EMM_REQUEST_LEN_LEGACY);
        let legacy = seal(&frame, credential);

        for raw in [current, legacy] {
            self.link.send_frame(&raw).map_err(|e| self.fail(e))?;
        }
        Ok(())
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
}
