use std::time::Duration;

use relay_core::{RelayError, RelayResult};

use crate::constants::{DEFAULT_BUILD, DEFAULT_VERSION};

/**
    Connection settings for a CCcam client session.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    /// Version string announced in the client data message.
    pub version: String,
    pub build: String,
    /// Cards with other caids are ignored. Empty accepts every card.
    pub caids: Vec<u16>,
    /// Fixed node id; generated from the clock when unset.
    pub node_id: Option<[u8; 8]>,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            version: DEFAULT_VERSION.to_string(),
            build: DEFAULT_BUILD.to_string(),
            caids: Vec::new(),
            node_id: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>, build: impl Into<String>) -> Self {
        self.version = version.into();
        self.build = build.into();
        self
    }

    pub fn with_caid(mut self, caid: u16) -> Self {
        self.caids.push(caid);
        self
    }

    pub fn with_node_id(mut self, node_id: [u8; 8]) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn accepts_caid(&self, caid: u16) -> bool {
        self.caids.is_empty() || self.caids.contains(&caid)
    }

    /**
        Reject settings that can never log in.
    */
    pub fn validate(&self) -> RelayResult<()> {
        if self.username.is_empty() {
            return Err(RelayError::InvalidConfig("username is empty".into()));
        }
        if self.password.is_empty() {
            return Err(RelayError::InvalidConfig("password is empty".into()));
        }
        Ok(())
    }
}
