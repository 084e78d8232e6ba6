use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;

use relay_camd35::{ClientConfig, EcmRequest, Event, LinkKind, RelayError, Session};

use crate::config::{Protocol, ReaderArgs, parse_hex_u16, parse_hex_u32};

/**
    Send one ECM to a camd35 (UDP) or cs378x (TCP) server and print the
    control word.
*/
#[derive(Args)]
pub struct Camd35Command {
    #[command(flatten)]
    reader: ReaderArgs,

    /**
        Use the TCP transport (cs378x) even if the reader says camd35.
    */
    #[arg(long)]
    tcp: bool,

    /// ECM payload (hex).
    #[arg(long)]
    ecm: String,

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
        Seconds to wait for the answer.
    */
    #[arg(long, default_value = "5")]
    timeout: u64,
}

impl Camd35Command {
    pub fn run(self) -> Result<()> {
        let reader = self.reader.resolve(Protocol::Camd35)?;
        let transport = match reader.protocol {
            Protocol::Cs378x => LinkKind::Tcp,
            Protocol::Camd35 if self.tcp => LinkKind::Tcp,
            Protocol::Camd35 => LinkKind::Udp,
            Protocol::Cccam => bail!("reader '{}' is not a camd35 reader", reader.label),
        };
        let Some(&caid) = reader.caids()?.first() else {
            bail!("sending an ECM needs --caid");
        };

        let request = EcmRequest {
            caid,
            provider_id: self.provider,
            service_id: self.sid,
            pid: self.pid,
            index: 1,
            payload: hex::decode(&self.ecm).context("ECM is not valid hex")?,
        };

        let config = ClientConfig::new(&reader.user, &reader.password)
            .with_transport(transport)
            .with_read_timeout(Duration::from_secs(1));
        let mut session = Session::open(&reader.host, reader.port, config)
            .with_context(|| format!("failed to connect to {}:{}", reader.host, reader.port))?;
        session.send_request(&request).context("failed to send ECM")?;
        eprintln!("ECM sent to {} ({transport:?})", reader.label);

        let deadline = Instant::now() + Duration::from_secs(self.timeout);
        let result = loop {
            if Instant::now() >= deadline {
                break Err(anyhow::anyhow!("no answer within {} s", self.timeout));
            }
            match session.receive() {
                Ok(Event::ControlWord { index, cw }) if index == request.index => {
                    println!("{cw}");
                    break Ok(());
                }
                Ok(Event::CardInfo(card)) => eprintln!(
                    "Card data: caid {:04X} serial {} ({} providers)",
                    card.caid,
                    hex::encode(&card.serial[..6]),
                    card.providers.len()
                ),
                Ok(Event::Rejected { .. }) => break Err(anyhow::anyhow!("ECM rejected")),
                Ok(Event::Stopped { reason, .. }) => {
                    break Err(anyhow::anyhow!("server stopped requests ({reason})"));
                }
                Ok(Event::PeerClosed) => {
                    break Err(anyhow::anyhow!("server closed the connection"));
                }
                Ok(_) | Err(RelayError::ReadTimeout) => {}
                Err(e) if !e.is_fatal() => tracing::warn!(error = %e, "frame dropped"),
                Err(e) => break Err(e).context("connection failed"),
            }
        };

        session.close();
        result
    }
}
