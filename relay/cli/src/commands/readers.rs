use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::config::ConfigFile;

/**
    List the readers of a configuration file.
*/
#[derive(Args)]
pub struct ReadersCommand {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

impl ReadersCommand {
    pub fn run(self) -> Result<()> {
        let config = ConfigFile::load(&self.config)?;
        if config.readers.is_empty() {
            eprintln!("No readers in {}", self.config.display());
            return Ok(());
        }

        for reader in &config.readers {
            println!(
                "{:<16} {:<8} {}@{}:{}  caid: {}",
                reader.label,
                format!("{:?}", reader.protocol).to_lowercase(),
                reader.user,
                reader.host,
                reader.port,
                if reader.caid.is_empty() {
                    "any".to_string()
                } else {
                    reader.caid.join(",")
                },
            );
        }
        Ok(())
    }
}
