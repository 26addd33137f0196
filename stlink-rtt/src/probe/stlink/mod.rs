pub mod constants;
mod request;
pub mod tools;
pub mod usb_interface;

use self::constants::{
    commands, Status, CORTEX_DESIGNER_ARM_ID, STM32_IDCODE_REGISTERS,
};
use self::request::Request;
use self::usb_interface::{StLinkUsb, StLinkUsbDevice};
use super::{DebugProbeError, DebugProbeInfo, ErrorKind};
use crate::config::ProbeConfig;
use crate::memory::{
    read_memory, write_memory, AccessWidth, MemoryInterface, MemoryPrimitives,
    MAX_8BIT_TRANSFER_SIZE,
};
use scroll::{Pread, LE};

/// Maximum length of 16- and 32-bit transfers in bytes.
///
/// Length has been determined by experimenting with
/// a ST-Link v2.
pub const STLINK_MAX_TRANSFER_SIZE: usize = 6144;

/// Only the first access port is ever used.
const ACCESS_PORT: u8 = 0;

/// A session with one ST-Link probe.
///
/// All transport calls go through `&mut self`, so at most one command is in flight.
#[derive(Debug)]
pub struct StLink<D: StLinkUsb> {
    device: D,
    name: String,
    max_transfer_size: usize,
}

impl StLink<StLinkUsbDevice> {
    /// Creates a session for the probe described by `info`. The probe is not opened yet.
    pub fn new_from_info(
        info: &DebugProbeInfo,
        config: &ProbeConfig,
    ) -> Result<Self, DebugProbeError> {
        let device = StLinkUsbDevice::new_from_info(info, config.usb_timeout)?;

        Self::new(device, info.identifier.clone(), config)
    }
}

impl<D: StLinkUsb> Drop for StLink<D> {
    fn drop(&mut self) {
        // We ignore the error cases as we can't do much about it anyways.
        if self.device.is_open() {
            let _ = self.exit_debug_mode();
        }
    }
}

impl<D: StLinkUsb> StLink<D> {
    pub fn new(
        device: D,
        name: impl Into<String>,
        config: &ProbeConfig,
    ) -> Result<Self, DebugProbeError> {
        if !config.max_transfer_size_is_valid() {
            return Err(StlinkError::InvalidMaxTransferSize(config.max_transfer_size).into());
        }

        Ok(Self {
            device,
            name: name.into(),
            max_transfer_size: config.max_transfer_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open(&mut self) -> Result<(), DebugProbeError> {
        self.device.open()
    }

    pub fn close(&mut self) -> Result<(), DebugProbeError> {
        self.device.close()
    }

    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    /// Sends one request and returns the (possibly truncated) response.
    fn execute(&mut self, request: &Request) -> Result<Vec<u8>, DebugProbeError> {
        if !self.device.is_open() {
            return Err(DebugProbeError::NotOpen);
        }

        tracing::trace!("Sending {:02x?}", request.header());

        let mut response = vec![0; request.read_len()];
        self.device
            .write(request.command(), request.data_out(), &mut response)?;

        Ok(request.finish(response))
    }

    /// Sends a request whose response starts with a status word and fails unless it is OK.
    ///
    /// Wait statuses are reported like any other failure.
    fn execute_checked(&mut self, request: &Request) -> Result<Vec<u8>, DebugProbeError> {
        let response = self.execute(request)?;
        let status = Status::from_response(&response);

        if status.is_ok() {
            Ok(response)
        } else {
            tracing::warn!(
                "Command {:02x?} failed with status {}",
                request.header(),
                status
            );
            Err(StlinkError::CommandFailed {
                command: request.sub_opcode(),
                status,
            }
            .into())
        }
    }

    /// Switches the probe into SWD debug mode.
    pub fn enter_swd(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Entering SWD mode");

        let request = Request::jtag(commands::JTAG_ENTER2)
            .with_u8(commands::JTAG_ENTER_SWD)
            .with_u8(ACCESS_PORT)
            .expect(2);

        self.execute_checked(&request).map(drop)
    }

    /// Leaves debug mode. The probe does not answer this command.
    pub fn exit_debug_mode(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Leaving debug mode");

        self.execute(&Request::jtag(commands::JTAG_EXIT)).map(drop)
    }

    /// Reads the IDCODE of the debug port.
    pub fn read_idcodes(&mut self) -> Result<u32, DebugProbeError> {
        let request = Request::jtag(commands::JTAG_READ_IDCODES).expect(12);
        let response = self.execute_checked(&request)?;

        let idcode: u32 =
            response
                .pread_with(4, LE)
                .map_err(|_| DebugProbeError::NotEnoughBytesRead {
                    is: response.len(),
                    should: 12,
                })?;

        tracing::debug!("IDCODE: {:#010x}", idcode);

        Ok(idcode)
    }

    /// Identifies the STM32 device behind the probe.
    ///
    /// Returns the 12-bit DEV_ID of the first DBGMCU IDCODE register that reads as non-zero,
    /// or `None` if none does. Registers that fault on the bus are skipped. A debug port that
    /// was not designed by ARM is reported as [`StlinkError::UnsupportedDesigner`].
    pub fn read_mcu_id(&mut self) -> Result<Option<u16>, DebugProbeError> {
        let idcode = self.read_idcodes()?;

        let designer = (idcode & 0xfff) as u16;
        if designer != CORTEX_DESIGNER_ARM_ID {
            return Err(StlinkError::UnsupportedDesigner(designer).into());
        }

        for (address, shift) in STM32_IDCODE_REGISTERS {
            let value = match self.read_mem_32bit(address, 4) {
                Ok(data) => data.pread_with::<u32>(0, LE).unwrap_or_default(),
                Err(error) if error.kind() == ErrorKind::TargetBus => {
                    tracing::debug!("No IDCODE register at {:#010x}: {}", address, error);
                    continue;
                }
                Err(error) => return Err(error),
            };

            let mcu_id = ((value >> shift) & 0xfff) as u16;
            if mcu_id != 0 {
                tracing::debug!("MCU id {:#05x} read from {:#010x}", mcu_id, address);
                return Ok(Some(mcu_id));
            }
        }

        Ok(None)
    }

    /// Asks the probe how the last memory command went.
    ///
    /// The memory commands themselves do not report bus errors, so every one of them is
    /// followed by this query. The 12 byte answer holds the status word at offset 0 and
    /// the faulting address at offset 4.
    pub fn get_last_rw_status(&mut self) -> Result<(), DebugProbeError> {
        let request = Request::jtag(commands::JTAG_GETLASTRWSTATUS2)
            .with_u8(ACCESS_PORT)
            .expect(12);

        let response = self.execute(&request)?;
        let status = Status::from_response(&response);

        if status.is_ok() {
            return Ok(());
        }

        let address: u32 =
            response
                .pread_with(4, LE)
                .map_err(|_| DebugProbeError::NotEnoughBytesRead {
                    is: response.len(),
                    should: 12,
                })?;

        tracing::debug!(
            "Memory access failed with status {} at {:#010x}",
            status,
            address
        );

        Err(StlinkError::TransferFault { status, address }.into())
    }

    fn memory_request<'a>(sub_opcode: u8, address: u32, size: usize) -> Request<'a> {
        Request::jtag(sub_opcode)
            .with_u32(address)
            .with_u16(size as u16)
            .with_u8(ACCESS_PORT)
    }

    fn read_mem(
        &mut self,
        width: AccessWidth,
        address: u32,
        size: usize,
    ) -> Result<Vec<u8>, DebugProbeError> {
        let (sub_opcode, max) = match width {
            AccessWidth::Bit8 => (commands::JTAG_READMEM_8BIT, MAX_8BIT_TRANSFER_SIZE),
            AccessWidth::Bit16 => (commands::JTAG_READMEM_16BIT, self.max_transfer_size),
            AccessWidth::Bit32 => (commands::JTAG_READMEM_32BIT, self.max_transfer_size),
        };

        check_transfer(width, address, size, max)?;

        tracing::trace!(
            "Read mem {:?}, address={:08x}, length={}",
            width,
            address,
            size
        );

        let request = Self::memory_request(sub_opcode, address, size);

        // The probe answers a one byte read with two bytes. Asking for fewer
        // overflows the USB transfer, so read two and drop the second.
        let request = if width == AccessWidth::Bit8 && size == 1 {
            request.expect(2).truncate_to(1)
        } else {
            request.expect(size)
        };

        let data = self.execute(&request)?;

        self.get_last_rw_status()?;

        Ok(data)
    }

    fn write_mem(
        &mut self,
        width: AccessWidth,
        address: u32,
        size: usize,
        data: &[u8],
    ) -> Result<(), DebugProbeError> {
        let (sub_opcode, max) = match width {
            AccessWidth::Bit8 => (commands::JTAG_WRITEMEM_8BIT, MAX_8BIT_TRANSFER_SIZE),
            AccessWidth::Bit16 => (commands::JTAG_WRITEMEM_16BIT, self.max_transfer_size),
            AccessWidth::Bit32 => (commands::JTAG_WRITEMEM_32BIT, self.max_transfer_size),
        };

        check_transfer(width, address, size, max)?;

        if data.len() < size {
            return Err(StlinkError::BufferTooShort {
                is: data.len(),
                should: size,
            }
            .into());
        }

        tracing::trace!(
            "Write mem {:?}, address={:08x}, length={}",
            width,
            address,
            size
        );

        // The header announces `size` bytes, anything sent beyond that confuses the probe.
        let data = &data[..size];

        let request = Self::memory_request(sub_opcode, address, size).with_data_out(data);

        self.execute(&request)?;

        self.get_last_rw_status()
    }

    /// Reads `size` bytes (1 to 64) at `address` with 8-bit accesses.
    pub fn read_mem_8bit(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem(AccessWidth::Bit8, address, size)
    }

    /// Reads `size` bytes at the 2-byte aligned `address`. `size` must be even and at most the
    /// configured `max_transfer_size`.
    pub fn read_mem_16bit(
        &mut self,
        address: u32,
        size: usize,
    ) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem(AccessWidth::Bit16, address, size)
    }

    /// Reads `size` bytes at the 4-byte aligned `address`. `size` must be a multiple of 4 and at
    /// most the configured `max_transfer_size`.
    pub fn read_mem_32bit(
        &mut self,
        address: u32,
        size: usize,
    ) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem(AccessWidth::Bit32, address, size)
    }

    pub fn write_mem_8bit(
        &mut self,
        address: u32,
        size: usize,
        data: &[u8],
    ) -> Result<(), DebugProbeError> {
        self.write_mem(AccessWidth::Bit8, address, size, data)
    }

    pub fn write_mem_16bit(
        &mut self,
        address: u32,
        size: usize,
        data: &[u8],
    ) -> Result<(), DebugProbeError> {
        self.write_mem(AccessWidth::Bit16, address, size, data)
    }

    /// Writes the first `size` bytes of `data`. A longer `data` is cut to `size`.
    pub fn write_mem_32bit(
        &mut self,
        address: u32,
        size: usize,
        data: &[u8],
    ) -> Result<(), DebugProbeError> {
        self.write_mem(AccessWidth::Bit32, address, size, data)
    }
}

fn check_transfer(
    width: AccessWidth,
    address: u32,
    size: usize,
    max: usize,
) -> Result<(), StlinkError> {
    if size == 0 || size > max {
        return Err(StlinkError::SizeOutOfRange { size, max });
    }

    let alignment = width.bytes();

    if address as usize % alignment != 0 {
        return Err(StlinkError::UnalignedAddress { address, alignment });
    }

    if size % alignment != 0 {
        return Err(StlinkError::UnalignedSize { size, alignment });
    }

    Ok(())
}

impl<D: StLinkUsb> MemoryPrimitives for StLink<D> {
    fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    fn read_8(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem_8bit(address, size)
    }

    fn read_16(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem_16bit(address, size)
    }

    fn read_32(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
        self.read_mem_32bit(address, size)
    }

    fn write_8(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError> {
        self.write_mem_8bit(address, size, data)
    }

    fn write_16(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError> {
        self.write_mem_16bit(address, size, data)
    }

    fn write_32(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError> {
        self.write_mem_32bit(address, size, data)
    }
}

impl<D: StLinkUsb> MemoryInterface for StLink<D> {
    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
        read_memory(self, address, size)
    }

    fn write(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError> {
        write_memory(self, address, size, data)
    }
}

/// Failures specific to the ST-Link.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum StlinkError {
    /// Transfer size {size} is outside the supported range of 1 to {max} bytes.
    SizeOutOfRange { size: usize, max: usize },

    /// Address {address:#010x} is not aligned to {alignment} bytes.
    UnalignedAddress { address: u32, alignment: usize },

    /// Transfer size {size} is not a multiple of {alignment} bytes.
    UnalignedSize { size: usize, alignment: usize },

    /// The supplied buffer holds {is} bytes but {should} bytes were requested.
    BufferTooShort { is: usize, should: usize },

    /// Accessing {size} bytes at {address:#010x} runs past the end of the address space.
    AddressOverflow { address: u32, size: usize },

    /// Maximum transfer size {0} is not a multiple of 4 between 4 and 6144 bytes.
    InvalidMaxTransferSize(usize),

    /// Command {command:#04x} failed with status {status}
    CommandFailed { command: u8, status: Status },

    /// Transfer failed with status {status} at address {address:#010x}
    TransferFault { status: Status, address: u32 },

    /// The debug port designer {0:#05x} is not ARM, the device is not supported.
    UnsupportedDesigner(u16),
}
