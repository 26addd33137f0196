use rusb::{Device, UsbContext};

use super::usb_interface::{read_serial_number, USB_PID_EP_MAP, USB_VID};
use crate::probe::DebugProbeInfo;

pub(super) fn is_stlink_device<T: UsbContext>(device: &Device<T>) -> bool {
    // Check the VID/PID.
    if let Ok(descriptor) = device.device_descriptor() {
        (descriptor.vendor_id() == USB_VID)
            && (USB_PID_EP_MAP.contains_key(&descriptor.product_id()))
    } else {
        false
    }
}

/// Lists all ST-Link probes attached to the host.
///
/// Probes that cannot be inspected (missing permissions, busy) are skipped.
pub fn list_stlink_devices() -> Vec<DebugProbeInfo> {
    let Ok(context) = rusb::Context::new() else {
        tracing::warn!("Could not create a libusb context");
        return vec![];
    };

    let Ok(devices) = context.devices() else {
        return vec![];
    };

    devices
        .iter()
        .filter(is_stlink_device)
        .filter_map(|device| {
            let descriptor = device.device_descriptor().ok()?;
            let info = USB_PID_EP_MAP.get(&descriptor.product_id())?;

            Some(DebugProbeInfo::new(
                format!("STLink {}", info.version_name),
                descriptor.vendor_id(),
                descriptor.product_id(),
                read_serial_number(&device),
            ))
        })
        .collect()
}
