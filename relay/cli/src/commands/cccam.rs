use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;

use relay_cccam::{ClientConfig, EcmRequest, Event, RelayError, Session};

use crate::config::{Protocol, ReaderArgs, parse_hex_u16, parse_hex_u32};

/**
    Log in to a CCcam server, list the cards it advertises and optionally
    send one ECM as soon as a card can serve it.
*/
#[derive(Args)]
pub struct CccamCommand {
    #[command(flatten)]
    reader: ReaderArgs,

    /**
        ECM to send (hex). Routed with the first configured caid.
    */
    #[arg(long)]
    ecm: Option<String>,

    /// Service id (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "0")]
    sid: u16,

    /// Provider id (hex).
    #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
    provider: u32,

    /// ECM pid (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "0")]
    pid: u16,

    /**
        Seconds to stay connected.
    */
    #[arg(long, default_value = "30")]
    duration: u64,
}

impl CccamCommand {
    pub fn run(self) -> Result<()> {
        let reader = self.reader.resolve(Protocol::Cccam)?;
        if reader.protocol != Protocol::Cccam {
            bail!("reader '{}' is not a cccam reader", reader.label);
        }
        let caids = reader.caids()?;

        let mut config = ClientConfig::new(&reader.user, &reader.password)
            .with_read_timeout(Duration::from_secs(1));
        if let Some(version) = &reader.version {
            let build = reader.build.clone().unwrap_or_else(|| config.build.clone());
            config = config.with_version(version, build);
        }
        for caid in &caids {
            config = config.with_caid(*caid);
        }

        let mut pending = match &self.ecm {
            Some(ecm) => {
                let Some(&caid) = caids.first() else {
                    bail!("sending an ECM needs --caid");
                };
                Some(EcmRequest {
                    caid,
                    provider_id: self.provider,
                    service_id: self.sid,
                    pid: self.pid,
                    index: 1,
                    payload: hex::decode(ecm).context("ECM is not valid hex")?,
                })
            }
            None => None,
        };

        let mut session = Session::open(&reader.host, reader.port, config)
            .with_context(|| format!("failed to log in to {}:{}", reader.host, reader.port))?;
        eprintln!(
            "Logged in to {} as {} (node id {})",
            reader.label,
            reader.user,
            hex::encode(session.node_id())
        );

        let deadline = Instant::now() + Duration::from_secs(self.duration);
        while Instant::now() < deadline {
            if let Some(request) = &pending {
                match session.send_request(request) {
                    Ok(()) => {
                        eprintln!("ECM sent");
                        pending = None;
                    }
                    Err(RelayError::NoEligibleCard { .. }) => {}
                    Err(e) => return Err(e).context("failed to send ECM"),
                }
            }

            match session.receive() {
                Ok(Event::ControlWord { cw, .. }) => println!("{cw}"),
                Ok(Event::Rejected { .. }) => eprintln!("ECM rejected"),
                Ok(Event::PeerClosed) => {
                    eprintln!("Server closed the connection");
                    break;
                }
                Ok(_) | Err(RelayError::ReadTimeout) => {}
                Err(e) if !e.is_fatal() => tracing::warn!(error = %e, "message dropped"),
                Err(e) => return Err(e).context("connection failed"),
            }
        }

        if let Some(server) = session.server_data() {
            eprintln!("Server: {} build {}", server.version, server.build);
        }
        let cards = session.cards();
        eprintln!("Cards ({}):", cards.len());
        let mut cursor = cards.cursor();
        while let Some(card) = cursor.current() {
            println!(
                "  {:08X} caid {:04X} hop {} providers {:06X?}",
                card.id,
                card.caid,
                card.hop,
                card.providers()
            );
            cursor.advance();
        }
        drop(cursor);

        session.close();
        Ok(())
    }
}
