use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use serde::Deserialize;

/**
    Protocol a reader speaks.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Cccam,
    /// camd 3.5x over UDP.
    Camd35,
    /// camd 3.5x over TCP.
    Cs378x,
}

/**
    One upstream server entry of the configuration file.

    ```yaml
    readers:
      - label: local
        protocol: cccam
        host: 127.0.0.1
        port: 12000
        user: user
        password: pass
        caid: ["0500", "1830"]
    ```
*/
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReaderConfig {
    pub label: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Hex caids; the first one is used for ECMs.
    #[serde(default)]
    pub caid: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
}

impl ReaderConfig {
    pub fn caids(&self) -> Result<Vec<u16>> {
        self.caid.iter().map(|c| parse_hex_u16(c).map_err(|e| anyhow!(e))).collect()
    }
}

/**
    Reader configuration file.
*/
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /**
        Find a reader by label (case-insensitive).
    */
    pub fn reader(&self, label: &str) -> Result<&ReaderConfig> {
        self.readers
            .iter()
            .find(|r| r.label.eq_ignore_ascii_case(label))
            .ok_or_else(|| anyhow!("reader '{label}' not found"))
    }
}

/**
    Connection arguments shared by the client commands. Anything given on
    the command line overrides the reader picked from the configuration file.
*/
#[derive(Args, Debug, Default)]
pub struct ReaderArgs {
    /**
        YAML file with reader definitions.
    */
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /**
        Label of the reader to use from the configuration file.
    */
    #[arg(short, long, requires = "config")]
    pub reader: Option<String>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(short, long)]
    pub password: Option<String>,

    /**
        Caid to filter on and to send ECMs for (hex). Can be repeated.
    */
    #[arg(long, value_parser = parse_hex_u16)]
    pub caid: Vec<u16>,
}

impl ReaderArgs {
    /**
        Merge the configuration file entry with the command line.
        `protocol` is used when no configuration entry names one.
    */
    pub fn resolve(&self, protocol: Protocol) -> Result<ReaderConfig> {
        let base = match (&self.config, &self.reader) {
            (Some(path), Some(label)) => Some(ConfigFile::load(path)?.reader(label)?.clone()),
            _ => None,
        };

        let host = self.host.clone().or_else(|| base.as_ref().map(|b| b.host.clone()));
        let port = self.port.or(base.as_ref().map(|b| b.port));
        let user = self.user.clone().or_else(|| base.as_ref().map(|b| b.user.clone()));
        let password = self
            .password
            .clone()
            .or_else(|| base.as_ref().map(|b| b.password.clone()));

        let (Some(host), Some(port), Some(user), Some(password)) = (host, port, user, password)
        else {
            bail!("host, port, user and password are required (or --config with --reader)");
        };

        let caid = if self.caid.is_empty() {
            base.as_ref().map(|b| b.caid.clone()).unwrap_or_default()
        } else {
            self.caid.iter().map(|c| format!("{c:04X}")).collect()
        };

        Ok(ReaderConfig {
            label: base
                .as_ref()
                .map(|b| b.label.clone())
                .unwrap_or_else(|| format!("{host}:{port}")),
            protocol: base.as_ref().map(|b| b.protocol).unwrap_or(protocol),
            host,
            port,
            user,
            password,
            caid,
            version: base.as_ref().and_then(|b| b.version.clone()),
            build: base.as_ref().and_then(|b| b.build.clone()),
        })
    }
}

pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{s}': {e}"))
}

pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
readers:
  - label: Local
    protocol: cccam
    host: 127.0.0.1
    port: 12000
    user: user
    password: pass
    caid: ["0500", "0x1830"]
    version: 2.3.2
  - label: udp
    protocol: camd35
    host: 10.0.0.2
    port: 2000
    user: u2
    password: p2
"#;

    #[test]
    fn parse_readers() {
        let config = ConfigFile::parse(CONFIG).unwrap();
        assert_eq!(config.readers.len(), 2);

        let local = config.reader("local").unwrap();
        assert_eq!(local.protocol, Protocol::Cccam);
        assert_eq!(local.port, 12000);
        assert_eq!(local.caids().unwrap(), vec![0x0500, 0x1830]);
        assert_eq!(local.version.as_deref(), Some("2.3.2"));

        let udp = config.reader("udp").unwrap();
        assert_eq!(udp.protocol, Protocol::Camd35);
        assert!(udp.caid.is_empty());

        assert!(config.reader("missing").is_err());
    }

    #[test]
    fn example_file_parses() {
        let config = ConfigFile::parse(include_str!("../readers.example.yaml")).unwrap();
        let tcp = config.reader("local-cs378x").unwrap();
        assert_eq!(tcp.protocol, Protocol::Cs378x);
        assert_eq!(tcp.caids().unwrap(), vec![0x1830]);
        assert_eq!(
            config.reader("local-cccam").unwrap().build.as_deref(),
            Some("3367")
        );
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let bad = CONFIG.replace("protocol: camd35", "protocol: newcamd");
        assert!(ConfigFile::parse(&bad).is_err());
    }

    #[test]
    fn command_line_only() {
        let args = ReaderArgs {
            host: Some("example.org".into()),
            port: Some(15000),
            user: Some("u".into()),
            password: Some("p".into()),
            caid: vec![0x0B00],
            ..Default::default()
        };
        let reader = args.resolve(Protocol::Cs378x).unwrap();
        assert_eq!(reader.label, "example.org:15000");
        assert_eq!(reader.protocol, Protocol::Cs378x);
        assert_eq!(reader.caids().unwrap(), vec![0x0B00]);
    }

    #[test]
    fn missing_fields() {
        let args = ReaderArgs {
            host: Some("example.org".into()),
            ..Default::default()
        };
        assert!(args.resolve(Protocol::Cccam).is_err());
    }

    #[test]
    fn hex_values() {
        assert_eq!(parse_hex_u16("0500"), Ok(0x0500));
        assert_eq!(parse_hex_u16("0x1830"), Ok(0x1830));
        assert!(parse_hex_u16("zz").is_err());
        assert_eq!(parse_hex_u32("023800"), Ok(0x023800));
    }
}
