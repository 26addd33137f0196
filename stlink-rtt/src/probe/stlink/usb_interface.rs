use once_cell::sync::Lazy;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::time::Duration;

use super::request::CMD_LEN;
use crate::probe::{DebugProbeError, DebugProbeInfo};

/// The USB VendorID.
pub const USB_VID: u16 = 0x0483;

/// Timeout used while enumerating probes.
pub(crate) const ENUMERATION_TIMEOUT: Duration = Duration::from_millis(100);

/// Map of USB PID to firmware version name and device endpoints.
#[rustfmt::skip]
pub static USB_PID_EP_MAP: Lazy<HashMap<u16, StLinkInfo>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(0x3748, StLinkInfo::new("V2",    0x3748, 0x02,   0x81,   0x83));
    m.insert(0x374b, StLinkInfo::new("V2-1",  0x374b, 0x01,   0x81,   0x82));
    m.insert(0x374a, StLinkInfo::new("V2-1",  0x374a, 0x01,   0x81,   0x82));  // Audio
    m.insert(0x3742, StLinkInfo::new("V2-1",  0x3742, 0x01,   0x81,   0x82));  // No MSD
    m.insert(0x3752, StLinkInfo::new("V2-1",  0x3752, 0x01,   0x81,   0x82));  // Unproven
    m.insert(0x374e, StLinkInfo::new("V3",    0x374e, 0x01,   0x81,   0x82));
    m.insert(0x374f, StLinkInfo::new("V3",    0x374f, 0x01,   0x81,   0x82));  // Bridge
    m.insert(0x3753, StLinkInfo::new("V3",    0x3753, 0x01,   0x81,   0x82));  // 2VCP
    m
});

/// A helper struct to match STLink deviceinfo.
#[derive(Clone, Debug, Default)]
pub struct StLinkInfo {
    pub version_name: String,
    pub usb_pid: u16,
    ep_out: u8,
    ep_in: u8,
    ep_swv: u8,
}

impl StLinkInfo {
    pub fn new<V: Into<String>>(
        version_name: V,
        usb_pid: u16,
        ep_out: u8,
        ep_in: u8,
        ep_swv: u8,
    ) -> Self {
        Self {
            version_name: version_name.into(),
            usb_pid,
            ep_out,
            ep_in,
            ep_swv,
        }
    }
}

/// The half duplex byte transport an [`StLink`](super::StLink) talks through.
///
/// At most one call is in flight at any time, which the `&mut self` receivers guarantee.
pub trait StLinkUsb: std::fmt::Debug {
    /// Claims the device. Opening an open device is a no-op.
    fn open(&mut self) -> Result<(), DebugProbeError>;

    /// Releases the device. Closing a closed device is a no-op.
    fn close(&mut self) -> Result<(), DebugProbeError>;

    fn is_open(&self) -> bool;

    /// Writes to the out EP and reads back data if needed.
    /// First the `cmd` is sent.
    /// In a second step `write_data` is transmitted.
    /// And lastly, data will be read back until `read_data` is filled.
    ///
    /// Short transfers in any phase are errors.
    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
    ) -> Result<(), DebugProbeError>;
}

/// An ST-Link attached over libusb.
pub struct StLinkUsbDevice {
    device: Device<Context>,
    device_handle: Option<DeviceHandle<Context>>,
    info: StLinkInfo,
    timeout: Duration,
}

impl std::fmt::Debug for StLinkUsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StLinkUsbDevice")
            .field("info", &self.info)
            .field("open", &self.device_handle.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StLinkUsbDevice {
    /// Looks up the USB device described by `probe_info`. The device is not opened yet.
    pub fn new_from_info(
        probe_info: &DebugProbeInfo,
        timeout: Duration,
    ) -> Result<Self, DebugProbeError> {
        let context = Context::new()?;

        tracing::debug!("Acquired libusb context.");

        let device = context
            .devices()
            .map_err(|_| DebugProbeError::ProbeCouldNotBeCreated)?
            .iter()
            .find(|device| matches_probe_info(device, probe_info))
            .ok_or(DebugProbeError::ProbeCouldNotBeCreated)?;

        let info = USB_PID_EP_MAP
            .get(&probe_info.product_id)
            .cloned()
            .ok_or(DebugProbeError::ProbeCouldNotBeCreated)?;

        Ok(Self {
            device,
            device_handle: None,
            info,
            timeout,
        })
    }

    pub fn info(&self) -> &StLinkInfo {
        &self.info
    }

    fn handle(&mut self) -> Result<&mut DeviceHandle<Context>, DebugProbeError> {
        self.device_handle.as_mut().ok_or(DebugProbeError::NotOpen)
    }
}

fn matches_probe_info<T: UsbContext>(device: &Device<T>, probe_info: &DebugProbeInfo) -> bool {
    let Ok(descriptor) = device.device_descriptor() else {
        return false;
    };

    if descriptor.vendor_id() != probe_info.vendor_id
        || descriptor.product_id() != probe_info.product_id
    {
        return false;
    }

    match &probe_info.serial_number {
        Some(serial) => read_serial_number(device).as_deref() == Some(serial.as_str()),
        None => true,
    }
}

pub(super) fn read_serial_number<T: UsbContext>(device: &Device<T>) -> Option<String> {
    let descriptor = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    let language = *handle.read_languages(ENUMERATION_TIMEOUT).ok()?.first()?;

    handle
        .read_serial_number_string(language, &descriptor, ENUMERATION_TIMEOUT)
        .ok()
}

impl StLinkUsb for StLinkUsbDevice {
    fn open(&mut self) -> Result<(), DebugProbeError> {
        if self.device_handle.is_some() {
            return Ok(());
        }

        let device_handle = self.device.open()?;

        tracing::debug!("Aquired handle for probe");

        let config = self.device.active_config_descriptor()?;

        tracing::debug!("Active config descriptor: {:?}", &config);

        device_handle.claim_interface(0)?;

        tracing::debug!("Claimed interface 0 of USB device.");

        let mut endpoint_out = false;
        let mut endpoint_in = false;
        let mut endpoint_swv = false;

        if let Some(interface) = config.interfaces().next() {
            if let Some(descriptor) = interface.descriptors().next() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.address() == self.info.ep_out {
                        endpoint_out = true;
                    } else if endpoint.address() == self.info.ep_in {
                        endpoint_in = true;
                    } else if endpoint.address() == self.info.ep_swv {
                        endpoint_swv = true;
                    }
                }
            }
        }

        if !endpoint_out || !endpoint_in {
            // Best effort, the endpoint error is the one worth reporting.
            let _ = device_handle.release_interface(0);
            return Err(DebugProbeError::EndpointNotFound);
        }

        if !endpoint_swv {
            tracing::debug!("Trace endpoint {:#04x} not present", self.info.ep_swv);
        }

        self.device_handle = Some(device_handle);

        tracing::debug!("Succesfully attached to STLink {}.", self.info.version_name);

        Ok(())
    }

    fn close(&mut self) -> Result<(), DebugProbeError> {
        if let Some(handle) = self.device_handle.take() {
            handle.release_interface(0)?;
            tracing::debug!("Released interface 0 of USB device.");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device_handle.is_some()
    }

    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
    ) -> Result<(), DebugProbeError> {
        let timeout = self.timeout;
        let ep_out = self.info.ep_out;
        let ep_in = self.info.ep_in;

        tracing::trace!(
            "Sending command {:x?} to STLink, timeout: {:?}",
            cmd,
            timeout
        );

        // Command phase.
        let mut padded_cmd = [0u8; CMD_LEN];
        let cmd_len = cmd.len().min(CMD_LEN);
        padded_cmd[..cmd_len].copy_from_slice(&cmd[..cmd_len]);

        let handle = self.handle()?;

        let written_bytes = handle.write_bulk(ep_out, &padded_cmd, timeout)?;

        if written_bytes != CMD_LEN {
            return Err(DebugProbeError::NotEnoughBytesWritten {
                is: written_bytes,
                should: CMD_LEN,
            });
        }

        // Optional data out phase.
        if !write_data.is_empty() {
            let written_bytes = handle.write_bulk(ep_out, write_data, timeout)?;
            if written_bytes != write_data.len() {
                return Err(DebugProbeError::NotEnoughBytesWritten {
                    is: written_bytes,
                    should: write_data.len(),
                });
            }
        }

        // Optional data in phase.
        if !read_data.is_empty() {
            let read_bytes = handle.read_bulk(ep_in, read_data, timeout)?;
            if read_bytes != read_data.len() {
                return Err(DebugProbeError::NotEnoughBytesRead {
                    is: read_bytes,
                    should: read_data.len(),
                });
            }
        }

        Ok(())
    }
}

impl Drop for StLinkUsbDevice {
    fn drop(&mut self) {
        // We ignore the error case as we can't do much about it anyways.
        let _ = self.close();
    }
}
