#![allow(clippy::doc_overindented_list_items)]

mod config;
mod server;
mod session;
mod slots;

pub mod crypto;
pub mod emm;
pub mod frame;
pub mod link;

// Re-export shared relay types from relay-core
pub use relay_core::{
    CardInfo, ControlWord, EcmRequest, EmmPacket, Event, RelayError, RelayResult, StopReason,
};

pub use self::config::{ClientConfig, LinkKind, ServerConfig};
pub use self::crypto::{Credential, Keyring};
pub use self::frame::{Command, Frame};
pub use self::link::{DatagramLink, Link, StreamLink};
pub use self::server::{Answer, Request, ServerSession};
pub use self::session::{FlowKey, Session};
pub use self::slots::RequestSlots;
