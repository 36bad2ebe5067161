mod control;
mod run;
mod show;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use control::{CancelPairCommand, ConfigCommand, PairCommand, UnpairCommand};
use run::RunCommand;
use show::ShowCommand;

use crate::{
    config::DaemonConfig,
    ipc::{self, Reply, Request, Response},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// The configuration file to read instead of the default one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// The command socket, overriding the configuration
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    Show(ShowCommand),
    Config(ConfigCommand),
    Pair(PairCommand),
    CancelPair(CancelPairCommand),
    Unpair(UnpairCommand),
}

impl Cli {
    fn load_config(&self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::load(self.config.as_deref())
            .context("could not load the configuration")?;
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        Ok(config)
    }

    /// Sends a request to the running daemon.
    ///
    /// With `--json` the raw response is printed and [`None`] returned.
    /// Errors reported by the daemon become errors here.
    async fn send(&self, request: Request) -> Result<Option<Reply>> {
        let config = self.load_config()?;
        let response = ipc::request(&config.socket_path, &request)
            .await
            .context("is the daemon running?")?;

        if self.json {
            println!("{}", serde_json::to_string(&response)?);
            if let Response::Error {
                ..
            } = response
            {
                std::process::exit(1);
            }
            return Ok(None);
        }

        match response {
            Response::Ok {
                result,
            } => Ok(Some(result)),
            Response::Error {
                kind,
                message,
            } => bail!("{message} ({})", serde_json::to_string(&kind)?.trim_matches('"')),
        }
    }
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    match &cli.command {
        Commands::Run(cmd) => cmd.execute(&cli).await,
        Commands::Show(cmd) => cmd.execute(&cli).await,
        Commands::Config(cmd) => cmd.execute(&cli).await,
        Commands::Pair(cmd) => cmd.execute(&cli).await,
        Commands::CancelPair(cmd) => cmd.execute(&cli).await,
        Commands::Unpair(cmd) => cmd.execute(&cli).await,
    }
}
