use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use crate::commands::{Camd35Command, CccamCommand, ReadersCommand};

/**
    Card sharing protocol client for testing against real peers.
*/
#[derive(Parser)]
#[command(name = "relay-cli")]
pub struct Cli {
    /// More logging (-v debug, -vv trace). Overrides RUST_LOG.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in to a CCcam server, watch its cards and optionally send an ECM.
    Cccam(CccamCommand),
    /// Send an ECM to a camd35 (UDP) or cs378x (TCP) server.
    Camd35(Camd35Command),
    /// List the readers of a configuration file.
    Readers(ReadersCommand),
}

impl Cli {
    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Cccam(cmd) => cmd.run(),
            Command::Camd35(cmd) => cmd.run(),
            Command::Readers(cmd) => cmd.run(),
        }
    }
}
