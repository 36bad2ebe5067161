//! The catalogue of device settings and how they are written to a device.

use std::{collections::BTreeMap, fmt, str::FromStr};

use hidpp::{
    device::Device,
    feature::{
        hires_wheel::{HiResWheelFeature, WheelModeSettings, WheelResolution},
        smartshift::{SmartShiftFeature, WheelMode},
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DaemonError, ErrorKind};

/// A setting the daemon knows how to persist and apply.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Setting {
    /// Whether the wheel ratchets or spins freely.
    SmartShiftMode,

    /// Quarter-turns per second after which the ratchet disengages.
    SmartShiftThreshold,

    /// High-resolution scroll reports.
    HiresScroll,

    ScrollInvert,
}

impl Setting {
    pub const ALL: [Setting; 4] = [
        Setting::SmartShiftMode,
        Setting::SmartShiftThreshold,
        Setting::HiresScroll,
        Setting::ScrollInvert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SmartShiftMode => "smart-shift-mode",
            Self::SmartShiftThreshold => "smart-shift-threshold",
            Self::HiresScroll => "hires-scroll",
            Self::ScrollInvert => "scroll-invert",
        }
    }

    /// Parses a value as typed by a user.
    pub fn parse_value(self, raw: &str) -> Result<SettingValue, DaemonError> {
        let raw = raw.trim().to_ascii_lowercase();
        let invalid = || DaemonError::InvalidSetting(format!("'{raw}' is no valid {self}"));

        let value = match self {
            Self::SmartShiftMode => match raw.as_str() {
                "ratchet" => SettingValue::Mode(RatchetMode::Ratchet),
                "freespin" => SettingValue::Mode(RatchetMode::Freespin),
                _ => return Err(invalid()),
            },
            Self::SmartShiftThreshold => {
                SettingValue::Threshold(raw.parse::<u8>().map_err(|_| invalid())?)
            },
            Self::HiresScroll | Self::ScrollInvert => match raw.as_str() {
                "true" | "on" | "yes" | "1" => SettingValue::Flag(true),
                "false" | "off" | "no" | "0" => SettingValue::Flag(false),
                _ => return Err(invalid()),
            },
        };

        self.check(value)?;
        Ok(value)
    }

    /// Checks that a value has the type and range this setting accepts.
    pub fn check(self, value: SettingValue) -> Result<(), DaemonError> {
        match (self, value) {
            (Self::SmartShiftMode, SettingValue::Mode(_)) => Ok(()),
            (Self::SmartShiftThreshold, SettingValue::Threshold(1..=255)) => Ok(()),
            (Self::HiresScroll | Self::ScrollInvert, SettingValue::Flag(_)) => Ok(()),
            _ => Err(DaemonError::InvalidSetting(format!("{value} is no valid {self}"))),
        }
    }

    /// Whether the device has the feature backing this setting.
    pub fn is_supported(self, device: &Device) -> bool {
        match self {
            Self::SmartShiftMode | Self::SmartShiftThreshold => {
                device.provides_feature::<SmartShiftFeature>()
            },
            Self::HiresScroll | Self::ScrollInvert => device.provides_feature::<HiResWheelFeature>(),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Setting {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|setting| setting.name() == s)
            .ok_or_else(|| DaemonError::InvalidSetting(format!("unknown setting '{s}'")))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatchetMode {
    Ratchet,
    Freespin,
}

impl From<RatchetMode> for WheelMode {
    fn from(mode: RatchetMode) -> Self {
        match mode {
            RatchetMode::Ratchet => WheelMode::Ratchet,
            RatchetMode::Freespin => WheelMode::Freespin,
        }
    }
}

/// The value of a [`Setting`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Flag(bool),
    Threshold(u8),
    Mode(RatchetMode),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Threshold(threshold) => write!(f, "{threshold}"),
            Self::Mode(RatchetMode::Ratchet) => f.write_str("ratchet"),
            Self::Mode(RatchetMode::Freespin) => f.write_str("freespin"),
        }
    }
}

/// Writes a single setting to a device.
pub async fn apply(device: &Device, setting: Setting, value: SettingValue) -> Result<(), DaemonError> {
    setting.check(value)?;

    let unsupported =
        || DaemonError::InvalidSetting(format!("the device does not support {setting}"));

    match (setting, value) {
        (Setting::SmartShiftMode, SettingValue::Mode(mode)) => {
            let feature = device.get_feature::<SmartShiftFeature>().ok_or_else(unsupported)?;
            feature
                .set_ratchet_control_mode(Some(mode.into()), None, None)
                .await?;
        },
        (Setting::SmartShiftThreshold, SettingValue::Threshold(threshold)) => {
            let feature = device.get_feature::<SmartShiftFeature>().ok_or_else(unsupported)?;
            feature
                .set_ratchet_control_mode(None, Some(threshold), None)
                .await?;
        },
        (Setting::HiresScroll | Setting::ScrollInvert, SettingValue::Flag(flag)) => {
            let feature = device.get_feature::<HiResWheelFeature>().ok_or_else(unsupported)?;
            let current = feature.get_wheel_mode().await?;

            let wanted = if setting == Setting::HiresScroll {
                WheelModeSettings {
                    resolution: if flag {
                        WheelResolution::High
                    } else {
                        WheelResolution::Low
                    },
                    ..current
                }
            } else {
                WheelModeSettings {
                    inverted: flag,
                    ..current
                }
            };

            if wanted != current {
                feature.set_wheel_mode(wanted).await?;
            }
        },
        // `check` rejected every other combination.
        _ => return Err(unsupported()),
    }

    debug!(device_index = device.device_index, %setting, %value, "applied setting");
    Ok(())
}

/// Writes every stored setting to a device.
///
/// Settings the device does not support are skipped. The first error that
/// means the device stopped answering aborts the remaining writes.
pub async fn apply_all(
    device: &Device,
    settings: &BTreeMap<Setting, SettingValue>,
) -> Result<(), DaemonError> {
    for (&setting, &value) in settings {
        if !setting.is_supported(device) {
            debug!(device_index = device.device_index, %setting, "skipping unsupported setting");
            continue;
        }

        match apply(device, setting, value).await {
            Ok(()) => {},
            Err(err) if err.is_miss() || err.kind() == ErrorKind::Cancelled => {
                return Err(err);
            },
            Err(err) => warn!(device_index = device.device_index, %setting, "could not apply setting: {err}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates_values() {
        assert_eq!(
            Setting::SmartShiftMode.parse_value("Freespin").unwrap(),
            SettingValue::Mode(RatchetMode::Freespin)
        );
        assert_eq!(
            Setting::SmartShiftThreshold.parse_value("12").unwrap(),
            SettingValue::Threshold(12)
        );
        assert_eq!(Setting::ScrollInvert.parse_value("on").unwrap(), SettingValue::Flag(true));

        assert!(Setting::SmartShiftThreshold.parse_value("0").is_err());
        assert!(Setting::SmartShiftThreshold.parse_value("256").is_err());
        assert!(Setting::HiresScroll.parse_value("ratchet").is_err());
    }

    #[test]
    fn rejects_mismatched_types() {
        assert!(
            Setting::HiresScroll
                .check(SettingValue::Mode(RatchetMode::Ratchet))
                .is_err()
        );
        assert!("smart-shift".parse::<Setting>().is_err());
        assert_eq!("scroll-invert".parse::<Setting>().unwrap(), Setting::ScrollInvert);
    }

    #[test]
    fn values_round_trip_through_json() {
        let settings = BTreeMap::from([
            (Setting::SmartShiftMode, SettingValue::Mode(RatchetMode::Ratchet)),
            (Setting::SmartShiftThreshold, SettingValue::Threshold(30)),
            (Setting::HiresScroll, SettingValue::Flag(false)),
        ]);

        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(
            json,
            r#"{"smart-shift-mode":"ratchet","smart-shift-threshold":30,"hires-scroll":false}"#
        );
        assert_eq!(
            serde_json::from_str::<BTreeMap<Setting, SettingValue>>(&json).unwrap(),
            settings
        );
    }
}
