use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};

use super::Cli;
use crate::{daemon::Daemon, logging::setup_logging, transport::AsyncHidSource};

/// Run the daemon in the foreground.
#[derive(Args)]
pub struct RunCommand {
    /// Use only the receiver at this HID node, e.g. /dev/hidraw2, and fail if
    /// it cannot be opened
    #[arg(long)]
    hidraw: Option<String>,

    /// The log filter, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Log more; repeat for even more
    #[arg(short, long, action = ArgAction::Count)]
    debug: u8,
}

impl RunCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let config = root.load_config()?;

        let level = match (self.debug, &self.log_level) {
            (0, Some(level)) => level.as_str(),
            (0, None) => config.log_level.as_str(),
            (1, _) => "debug",
            _ => "trace",
        };
        setup_logging(level).context("invalid log filter")?;

        let daemon = Daemon::new(config, Arc::new(AsyncHidSource), self.hidraw.clone())
            .context("could not set up the daemon")?;

        Arc::new(daemon).run().await.context("the daemon failed")
    }
}
