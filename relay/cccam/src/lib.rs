#![allow(clippy::doc_overindented_list_items)]

mod card;
mod config;
mod message;
mod node_id;
mod session;

pub mod constants;
pub mod crypto;

// Re-export shared relay types from relay-core
pub use relay_core::{ControlWord, EcmRequest, Event, RelayError, RelayResult};

pub use self::card::{Card, Route, select_card};
pub use self::config::ClientConfig;
pub use self::message::{Header, MessageType, ServerData};
pub use self::node_id::NodeIdGenerator;
pub use self::session::{Session, SessionState};
