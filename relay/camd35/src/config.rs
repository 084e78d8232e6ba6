use std::time::Duration;

use relay_core::{RelayError, RelayResult};

use crate::crypto::Credential;

/**
    Transport a camd 3.5x connection runs over.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkKind {
    /// camd35: one frame per datagram.
    #[default]
    Udp,
    /// cs378x: frames over a TCP stream.
    Tcp,
}

/**
    Connection settings for a camd 3.5x client session.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    pub transport: LinkKind,
    /// Only used by the TCP transport.
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            transport: LinkKind::default(),
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

    pub fn with_transport(mut self, transport: LinkKind) -> Self {
        self.transport = transport;
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

    pub fn credential(&self) -> Credential {
        Credential::new(&self.username, &self.password)
    }

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

/**
    Settings shared by every server session.
*/
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub accounts: Vec<Credential>,
    /// Answer "invalid" with the legacy rejection instead of a stop command.
    pub suppress_cmd08: bool,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, username: &str, password: &str) -> Self {
        self.accounts.push(Credential::new(username, password));
        self
    }

    pub fn with_suppress_cmd08(mut self, suppress: bool) -> Self {
        self.suppress_cmd08 = suppress;
        self
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.accounts.is_empty() {
            return Err(RelayError::InvalidConfig("no accounts".into()));
        }
        if let Some(empty) = self.accounts.iter().find(|a| a.username().is_empty()) {
            return Err(RelayError::InvalidConfig(format!(
                "account with empty username ({empty:?})"
            )));
        }
        Ok(())
    }
}
