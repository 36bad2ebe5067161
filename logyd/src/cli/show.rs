use std::io::{BufWriter, Write};

use anyhow::Result;
use clap::Args;
use hidpp::feature::unified_battery::BatteryLevel;
use owo_colors::OwoColorize;

use super::Cli;
use crate::{
    ipc::{Reply, Request},
    pairing::PairingPhase,
    registry::{ConnectionState, DeviceEntry, ReceiverSnapshot, Snapshot},
};

/// View the receivers and devices known to the daemon.
#[derive(Args)]
pub struct ShowCommand {}

impl ShowCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let Some(Reply::Snapshot(snapshot)) = root.send(Request::Show).await? else {
            return Ok(());
        };

        let mut stdout = BufWriter::new(anstream::stdout());
        render(&mut stdout, &snapshot)?;
        stdout.flush()?;

        Ok(())
    }
}

fn render(out: &mut impl Write, snapshot: &Snapshot) -> Result<()> {
    if snapshot.receivers.is_empty() {
        writeln!(out, "{}", "No receivers were found.".bright_black())?;
        return Ok(());
    }

    for (receiver_i, receiver) in snapshot.receivers.iter().enumerate() {
        if receiver_i != 0 {
            writeln!(out)?;
        }
        render_receiver(out, receiver)?;
    }

    Ok(())
}

fn render_receiver(out: &mut impl Write, view: &ReceiverSnapshot) -> Result<()> {
    let receiver = &view.receiver;

    writeln!(
        out,
        "{}: {} ({:#06x}:{:#06x}){}",
        receiver.id.bright_black(),
        receiver.path,
        receiver.vendor_id.bright_black(),
        receiver.product_id.bright_black(),
        if receiver.online {
            String::new()
        } else {
            format!(" {}", "offline".red().italic())
        }
    )?;

    if let Some(firmware) = receiver.firmware {
        writeln!(out, " │  FIRMWARE: {}", firmware.bright_black())?;
    }

    if let Some(pairing) = &receiver.pairing {
        let phase = match pairing.phase {
            PairingPhase::Paired {
                slot,
            } => format!("paired to slot {slot}").green().to_string(),
            PairingPhase::Failed {
                reason,
            } => format!("failed ({reason:?})").red().to_string(),
            phase => format!("{phase:?}").yellow().to_string(),
        };
        writeln!(out, " │  PAIRING: {phase}")?;

        if let Some(candidate) = &pairing.candidate {
            writeln!(
                out,
                " │    CANDIDATE: {} ({:?})",
                candidate.name.as_deref().unwrap_or("unnamed"),
                candidate.kind.green()
            )?;
        }
        if let Some(passkey) = &pairing.passkey {
            writeln!(out, " │    PASSKEY: {}", passkey.bold())?;
        }
    }
    writeln!(out, " │")?;

    if view.devices.is_empty() {
        writeln!(out, " ╰─ {}", "No devices are paired.".bright_black().italic())?;
        return Ok(());
    }

    let devices_len = view.devices.len();
    for (device_i, device) in view.devices.iter().enumerate() {
        let last = device_i == devices_len - 1;
        if device_i != 0 {
            writeln!(out, " │")?;
        }

        render_device(out, device, last)?;
    }

    Ok(())
}

fn render_device(out: &mut impl Write, device: &DeviceEntry, last: bool) -> Result<()> {
    let connected = device.state == ConnectionState::Connected;

    writeln!(
        out,
        "{} {}: {} {} ({:?}) ({:#06x})",
        if last { " ╰─" } else { " ├─" },
        device.slot.bright_blue(),
        match device.state {
            ConnectionState::Connected => "●".green().into_styled(),
            ConnectionState::Unreachable => "●".yellow().into_styled(),
            ConnectionState::Disconnected => "●".red().into_styled(),
        },
        if connected {
            device.name.clone()
        } else {
            device.name.bright_black().italic().to_string()
        },
        device.kind.green(),
        device.wpid.bright_black(),
    )?;

    let mut properties = vec![format!("IDENTITY: {}", device.identity.bright_black())];
    if device.codename != device.name && !device.codename.is_empty() {
        properties.push(format!("CODENAME: {}", device.codename.bright_black()));
    }
    if let Some(battery) = device.battery {
        properties.push(format!(
            "BATTERY: {:?} ({}), {:?}",
            match battery.level {
                BatteryLevel::Full | BatteryLevel::Good => battery.level.green().into_styled(),
                BatteryLevel::Low => battery.level.yellow().into_styled(),
                BatteryLevel::Critical => battery.level.bright_red().into_styled(),
                _ => battery.level.default_color().into_styled(),
            },
            format!("{}%", battery.charging_percentage).blue(),
            battery.status.bright_black()
        ));
    }
    for (setting, value) in &device.settings {
        properties.push(format!("{}: {}", setting.name().to_uppercase(), value.bright_black()));
    }
    if device.config_mismatch {
        properties.push(format!(
            "{}",
            "stored settings belong to another product and are not applied".yellow()
        ));
    }

    let properties_len = properties.len();
    for (property_i, property) in properties.into_iter().enumerate() {
        writeln!(
            out,
            "{}{} {}",
            if last { "         " } else { " │       " },
            if property_i == properties_len - 1 {
                "╰─"
            } else {
                "├─"
            },
            property
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hidpp::receiver::bolt::BoltDeviceKind;

    use super::*;
    use crate::registry::ReceiverEntry;

    #[test]
    fn renders_devices_as_a_tree() {
        let snapshot = Snapshot {
            receivers: vec![ReceiverSnapshot {
                receiver: ReceiverEntry {
                    id: "5E3F8A21C0D4B967".to_string(),
                    path: "/dev/hidraw3".to_string(),
                    vendor_id: 0x046d,
                    product_id: 0xc548,
                    firmware: None,
                    max_slots: 6,
                    online: true,
                    pairing: None,
                },
                devices: vec![DeviceEntry {
                    receiver: "5E3F8A21C0D4B967".to_string(),
                    slot: 1,
                    identity: "4A1B2C01".to_string(),
                    name: "MX Master 3S B".to_string(),
                    codename: "MX Master 3S".to_string(),
                    kind: BoltDeviceKind::Mouse,
                    wpid: 0xb034,
                    state: ConnectionState::Connected,
                    battery: None,
                    features: Vec::new(),
                    settings: BTreeMap::new(),
                    config_mismatch: false,
                    misses: 0,
                }],
            }],
        };

        let mut out = Vec::new();
        render(&mut out, &snapshot).unwrap();
        let text = anstream::adapter::strip_str(&String::from_utf8(out).unwrap()).to_string();

        assert!(text.starts_with("5E3F8A21C0D4B967: /dev/hidraw3 (0x046d:0xc548)\n"));
        assert!(text.contains(" ╰─ 1: ● MX Master 3S B (Mouse) (0xb034)"));
        assert!(text.contains("╰─ CODENAME: MX Master 3S"));
    }
}
