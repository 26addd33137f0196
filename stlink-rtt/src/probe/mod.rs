//! Probe discovery, the transport error taxonomy and the ST-Link driver.

pub mod stlink;

use self::stlink::constants::StatusClass;
use self::stlink::StlinkError;

/// Where a failure originated, which also decides what the caller can do about it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A parameter was rejected before anything was sent to the probe.
    Validation,
    /// The target bus faulted. The error carries the faulting address.
    TargetBus,
    /// The probe rejected the command or was busy.
    Protocol,
    /// The USB transfer itself failed or the device is not open.
    Transport,
}

/// An error raised while talking to a debug probe.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum DebugProbeError {
    /// USB communication error
    Usb(#[from] rusb::Error),

    /// The probe is not open.
    NotOpen,

    /// Not enough bytes read from the probe: expected {should}, got {is}.
    NotEnoughBytesRead { is: usize, should: usize },

    /// Not enough bytes written to the probe: expected {should}, wrote {is}.
    NotEnoughBytesWritten { is: usize, should: usize },

    /// Probe could not be created.
    ProbeCouldNotBeCreated,

    /// Usb endpoint not found.
    EndpointNotFound,

    /// {0}
    StLink(#[from] StlinkError),
}

impl DebugProbeError {
    /// Sorts the error into the category that tells the caller how to react.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DebugProbeError::StLink(error) => error.kind(),
            DebugProbeError::Usb(_)
            | DebugProbeError::NotOpen
            | DebugProbeError::NotEnoughBytesRead { .. }
            | DebugProbeError::NotEnoughBytesWritten { .. }
            | DebugProbeError::ProbeCouldNotBeCreated
            | DebugProbeError::EndpointNotFound => ErrorKind::Transport,
        }
    }

    /// The target address that caused a bus fault, if this is one.
    pub fn fault_address(&self) -> Option<u32> {
        match self {
            DebugProbeError::StLink(StlinkError::TransferFault { address, .. }) => Some(*address),
            _ => None,
        }
    }
}

impl StlinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StlinkError::SizeOutOfRange { .. }
            | StlinkError::UnalignedAddress { .. }
            | StlinkError::UnalignedSize { .. }
            | StlinkError::BufferTooShort { .. }
            | StlinkError::AddressOverflow { .. }
            | StlinkError::InvalidMaxTransferSize(_) => ErrorKind::Validation,
            StlinkError::TransferFault { .. } => ErrorKind::TargetBus,
            StlinkError::CommandFailed { status, .. } => match status.class() {
                StatusClass::TargetBus => ErrorKind::TargetBus,
                _ => ErrorKind::Protocol,
            },
            StlinkError::UnsupportedDesigner(_) => ErrorKind::Protocol,
        }
    }
}

/// Identifies an attached probe.
#[derive(Clone, PartialEq, Eq)]
pub struct DebugProbeInfo {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl std::fmt::Debug for DebugProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} (VID: {:04x}, PID: {:04x}{})",
            self.identifier,
            self.vendor_id,
            self.product_id,
            self.serial_number
                .as_ref()
                .map_or(String::new(), |v| format!(", Serial: {v}")),
        )
    }
}

impl DebugProbeInfo {
    /// Creates a new info struct that uniquely identifies a probe.
    pub fn new<S: Into<String>>(
        identifier: S,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            vendor_id,
            product_id,
            serial_number,
        }
    }
}
