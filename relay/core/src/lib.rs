mod error;
mod registry;
mod types;

pub mod net;
pub mod utils;

pub use self::error::{RelayError, RelayResult};
pub use self::net::Transport;
pub use self::registry::{Cursor, EntryId, Registry};
pub use self::types::{
    CardInfo, ControlWord, EcmRequest, EmmFilter, EmmPacket, Event, ProviderInfo, StopReason,
};
pub use self::utils::{ReadBe, boundary};
