use anyhow::{Context, Result, bail};
use clap::Args;
use owo_colors::OwoColorize;

use super::Cli;
use crate::{
    ipc::{self, Reply, Request, Response},
    registry::DeviceEntry,
};

/// Change a setting of a device.
///
/// The value is stored and applied whenever the device connects.
#[derive(Args)]
pub struct ConfigCommand {
    /// The identity of the device, as shown by `show`
    device: String,

    /// One of smart-shift-mode, smart-shift-threshold, hires-scroll or
    /// scroll-invert
    setting: String,

    value: String,
}

impl ConfigCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let request = Request::Configure {
            device: self.device.clone(),
            setting: self.setting.clone(),
            value: self.value.clone(),
        };
        let Some(Reply::Configured(outcome)) = root.send(request).await? else {
            return Ok(());
        };

        anstream::println!(
            "{} {} = {} {}",
            device_label(&outcome.device),
            self.setting.bold(),
            self.value.green(),
            if outcome.applied {
                "(applied)".bright_black().to_string()
            } else {
                "(stored, applied on reconnect)".yellow().to_string()
            }
        );
        Ok(())
    }
}

/// Pair a new device, waiting until it is paired or the attempt ends.
#[derive(Args)]
pub struct PairCommand {
    /// The receiver to pair with; may be omitted if there is only one
    receiver: Option<String>,

    /// Seconds to wait for a device, at most 60
    #[arg(short, long)]
    timeout: Option<u64>,
}

impl PairCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let receiver = match &self.receiver {
            Some(receiver) => receiver.clone(),
            None => only_receiver(root).await?,
        };

        if !root.json {
            anstream::println!(
                "{}",
                format!("Turn on the device to pair with {receiver}...").bright_black()
            );
        }

        let request = Request::Pair {
            receiver,
            timeout_secs: self.timeout,
        };
        let Some(Reply::Paired(device)) = root.send(request).await? else {
            return Ok(());
        };

        anstream::println!("{} {}", "Paired".green(), device_label(&device));
        Ok(())
    }
}

/// Stop a running pairing attempt.
#[derive(Args)]
pub struct CancelPairCommand {
    receiver: String,
}

impl CancelPairCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let request = Request::CancelPair {
            receiver: self.receiver.clone(),
        };
        let Some(Reply::PairingCancelled {
            cancelled,
        }) = root.send(request).await?
        else {
            return Ok(());
        };

        if cancelled {
            anstream::println!("{}", "Pairing cancelled".yellow());
        } else {
            anstream::println!("{}", "No pairing attempt was running".bright_black());
        }
        Ok(())
    }
}

/// Unpair a device. Its stored settings are kept.
#[derive(Args)]
pub struct UnpairCommand {
    device: String,
}

impl UnpairCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let request = Request::Unpair {
            device: self.device.clone(),
        };
        let Some(Reply::Unpaired(device)) = root.send(request).await? else {
            return Ok(());
        };

        anstream::println!("{} {}", "Unpaired".yellow(), device_label(&device));
        Ok(())
    }
}

fn device_label(device: &DeviceEntry) -> String {
    format!(
        "{} {} {}",
        device.name,
        format!("({:?})", device.kind).green(),
        device.identity.bright_black()
    )
}

/// Looks up the ID of the only receiver the daemon has open.
async fn only_receiver(root: &Cli) -> Result<String> {
    let config = root.load_config()?;
    let response = ipc::request(&config.socket_path, &Request::Show)
        .await
        .context("is the daemon running?")?;

    let Response::Ok {
        result: Reply::Snapshot(snapshot),
    } = response
    else {
        bail!("unexpected response from the daemon");
    };

    let mut online = snapshot
        .receivers
        .into_iter()
        .filter(|view| view.receiver.online)
        .map(|view| view.receiver.id);

    match (online.next(), online.next()) {
        (Some(id), None) => Ok(id),
        (None, _) => bail!("no receiver is connected"),
        (Some(_), Some(_)) => bail!("more than one receiver is connected, name one"),
    }
}
