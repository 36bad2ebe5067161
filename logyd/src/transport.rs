//! Implements HID communication using the `async-hid` crate.

use std::{fs::File, io::Read, path::Path, time::Duration};

use async_hid::{
    AsyncHidRead,
    AsyncHidWrite,
    Device,
    DeviceId,
    DeviceInfo,
    DeviceReader,
    DeviceWriter,
    HidBackend,
};
use async_trait::async_trait;
use futures_lite::StreamExt;
use hidpp::{
    channel::{ChannelError, HidppChannel, RawHidChannel, TransportError},
    receiver,
};
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A HID node as seen by a scan.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Finds and opens the HID nodes of supported receivers.
#[async_trait]
pub trait NodeSource: Send + Sync + 'static {
    /// Lists the nodes belonging to supported receivers.
    async fn scan(&self) -> Result<Vec<NodeInfo>, TransportError>;

    /// Opens a HID++ channel on the node at `path`.
    ///
    /// Returns [`ChannelError::HidppNotSupported`] for interfaces of a
    /// receiver that do not speak HID++.
    async fn open(&self, path: &str, poll_interval: Duration) -> Result<HidppChannel, ChannelError>;
}

/// The [`NodeSource`] backed by the platform's HID API.
#[derive(Default)]
pub struct AsyncHidSource;

#[async_trait]
impl NodeSource for AsyncHidSource {
    async fn scan(&self) -> Result<Vec<NodeInfo>, TransportError> {
        Ok(enumerate()
            .await?
            .into_iter()
            .map(|dev| {
                let info = dev.to_device_info();
                NodeInfo {
                    path: node_path(&info.id),
                    vendor_id: info.vendor_id,
                    product_id: info.product_id,
                }
            })
            .filter(|node| receiver::is_supported(node.vendor_id, node.product_id))
            .collect())
    }

    async fn open(&self, path: &str, poll_interval: Duration) -> Result<HidppChannel, ChannelError> {
        let dev = enumerate()
            .await?
            .into_iter()
            .find(|dev| node_path(&dev.id) == path)
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{path} does not exist"),
                ))
            })?;

        let (reader, writer) = dev.open().await.map_err(backend)?;
        debug!(path, "opened HID node");

        HidppChannel::from_raw_channel_with(
            AsyncHidDevice {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                info: dev.to_device_info(),
                path: path.to_string(),
            },
            poll_interval,
        )
        .await
    }
}

struct AsyncHidDevice {
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
    info: DeviceInfo,
    path: String,
}

#[async_trait]
impl RawHidChannel for AsyncHidDevice {
    fn vendor_id(&self) -> u16 {
        self.info.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.info.product_id
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    async fn write_report(&self, src: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.writer.lock().await;
        guard.write_output_report(src).await.map_err(backend)?;
        Ok(src.len())
    }

    async fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut guard = self.reader.lock().await;
        match tokio::time::timeout(timeout, guard.read_input_report(buf)).await {
            Ok(read) => read.map_err(backend),
            Err(_) => Ok(0),
        }
    }

    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        None
    }

    async fn get_report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let DeviceId::DevPath(ref path) = self.info.id else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "report descriptors are currently only supported on Linux",
            )));
        };

        let mut file = File::open(path.join("device/report_descriptor"))?;
        Ok(file.read(buf)?)
    }
}

async fn enumerate() -> Result<Vec<Device>, TransportError> {
    let devices: Vec<Device> = HidBackend::default()
        .enumerate()
        .await
        .map_err(backend)?
        .collect::<Vec<Device>>()
        .await
        .into_iter()
        .unique_by(|dev| dev.id.clone())
        .collect();

    trace!(count = devices.len(), "enumerated HID nodes");
    Ok(devices)
}

/// The device node path for a HID ID. On Linux the ID is the sysfs directory
/// of a `hidraw` node, whose name is also its name under `/dev`.
fn node_path(id: &DeviceId) -> String {
    match id {
        DeviceId::DevPath(path) => sysfs_to_dev(path),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

fn sysfs_to_dev(path: &Path) -> String {
    path.file_name()
        .map(|name| Path::new("/dev").join(name).display().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn backend(err: async_hid::HidError) -> TransportError {
    TransportError::Backend(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_nodes_map_to_dev() {
        assert_eq!(
            sysfs_to_dev(Path::new("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.2/0003:046D:C548.0004/hidraw/hidraw3")),
            "/dev/hidraw3"
        );
    }
}
