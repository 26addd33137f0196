pub mod commands {
    // Common commands.
    pub const JTAG_COMMAND: u8 = 0xf2;

    // JTAG commands.
    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_READMEM_8BIT: u8 = 0x0c;
    pub const JTAG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const JTAG_EXIT: u8 = 0x21;

    // The following commands are from Version 2 of the API.
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_READ_IDCODES: u8 = 0x31;

    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3e; // From V2J15
    pub const JTAG_READMEM_16BIT: u8 = 0x47; // From V2J26
    pub const JTAG_WRITEMEM_16BIT: u8 = 0x48; // From V2J26

    // Parameters for JTAG_ENTER2.
    pub const JTAG_ENTER_SWD: u8 = 0xa3;
}

/// Designer code of ARM in the low 12 bits of a Cortex IDCODE.
pub const CORTEX_DESIGNER_ARM_ID: u16 = 0x477;

/// Locations of the STM32 DBGMCU IDCODE register, in the order they are probed.
///
/// The second field tells how far the 12-bit device id is shifted inside the register.
pub const STM32_IDCODE_REGISTERS: [(u32, u32); 5] = [
    (0xe004_2000, 0),  // DBGMCU on Cortex-M3/M4/M7 parts
    (0x4001_5800, 0),  // DBGMCU on Cortex-M0/M0+ parts
    (0x5c00_1000, 0),  // STM32H7
    (0x4000_4000, 12), // STM32W
    (0xe004_4000, 0),  // STM32L5
];

/// Coarse meaning of a [`Status`] code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusClass {
    /// The command succeeded.
    Ok,
    /// The probe or target was busy. Nothing retries these automatically.
    Wait,
    /// The probe rejected or could not carry out the command.
    Protocol,
    /// The target bus signalled an error for the accessed address.
    TargetBus,
}

/// STLink status codes and messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, docsplay::Display)]
pub enum Status {
    /// OK (0x80)
    JtagOk,
    /// unknown error (0x01)
    JtagUnknownError,
    /// SPI error (0x02)
    JtagSpiError,
    /// DMA error (0x03)
    JtagDmaError,
    /// unknown JTAG chain (0x04)
    JtagUnknownJtagChain,
    /// no device connected (0x05)
    JtagNoDeviceConnected,
    /// internal error (0x06)
    JtagInternalError,
    /// command wait (0x07)
    JtagCmdWait,
    /// command error (0x08)
    JtagCmdError,
    /// IDCODE error (0x09)
    JtagGetIdcodeError,
    /// alignment error (0x0a)
    JtagAlignmentError,
    /// debug power error (0x0b)
    JtagDbgPowerError,
    /// write error (0x0c)
    JtagWriteError,
    /// write verification error (0x0d)
    JtagWriteVerifError,
    /// already opened in another mode (0x0e)
    JtagAlreadyOpenedInOtherMode,
    /// access port wait (0x10)
    SwdApWait,
    /// access port fault (0x11)
    SwdApFault,
    /// access port error (0x12)
    SwdApError,
    /// access port parity error (0x13)
    SwdApParityError,
    /// debug port wait (0x14)
    SwdDpWait,
    /// debug port fault (0x15)
    SwdDpFault,
    /// debug port error (0x16)
    SwdDpError,
    /// debug port parity error (0x17)
    SwdDpParityError,
    /// access port write data error (0x18)
    SwdApWdataError,
    /// access port sticky error (0x19)
    SwdApStickyError,
    /// access port sticky overrun error (0x1a)
    SwdApStickyorunError,
    /// access port already in use (0x1b)
    SwdApAlreadyUsed,
    /// trace access port turnaround error (0x1c)
    SwdTraceApTurnaround,
    /// bad access port (0x1d)
    BadAp,
    /// SWO not available (0x20)
    SwvNotAvailable,
    /// no jump to loader (0x21)
    JtagNoJumpToLoader,
    /// TCP/IP error (0x30)
    JtagTcpError,
    /// TCP/IP busy (0x31)
    JtagTcpBusy,
    /// configuration changed (0x40)
    JtagConfChanged,
    /// frequency not supported (0x41)
    JtagFreqNotSupported,
    /// unknown command (0x42)
    JtagUnknownCmd,
    /// error reported by old firmware (0x81)
    JtagOldError,
    /// unknown status {0:#06x}
    Other(u16),
}

impl From<u16> for Status {
    fn from(value: u16) -> Status {
        match value {
            0x80 => Self::JtagOk,
            0x01 => Self::JtagUnknownError,
            0x02 => Self::JtagSpiError,
            0x03 => Self::JtagDmaError,
            0x04 => Self::JtagUnknownJtagChain,
            0x05 => Self::JtagNoDeviceConnected,
            0x06 => Self::JtagInternalError,
            0x07 => Self::JtagCmdWait,
            0x08 => Self::JtagCmdError,
            0x09 => Self::JtagGetIdcodeError,
            0x0A => Self::JtagAlignmentError,
            0x0B => Self::JtagDbgPowerError,
            0x0C => Self::JtagWriteError,
            0x0D => Self::JtagWriteVerifError,
            0x0E => Self::JtagAlreadyOpenedInOtherMode,
            0x10 => Self::SwdApWait,
            0x11 => Self::SwdApFault,
            0x12 => Self::SwdApError,
            0x13 => Self::SwdApParityError,
            0x14 => Self::SwdDpWait,
            0x15 => Self::SwdDpFault,
            0x16 => Self::SwdDpError,
            0x17 => Self::SwdDpParityError,
            0x18 => Self::SwdApWdataError,
            0x19 => Self::SwdApStickyError,
            0x1A => Self::SwdApStickyorunError,
            0x1B => Self::SwdApAlreadyUsed,
            0x1C => Self::SwdTraceApTurnaround,
            0x1D => Self::BadAp,
            0x20 => Self::SwvNotAvailable,
            0x21 => Self::JtagNoJumpToLoader,
            0x30 => Self::JtagTcpError,
            0x31 => Self::JtagTcpBusy,
            0x40 => Self::JtagConfChanged,
            0x41 => Self::JtagFreqNotSupported,
            0x42 => Self::JtagUnknownCmd,
            0x81 => Self::JtagOldError,
            v => Self::Other(v),
        }
    }
}

impl Status {
    /// Decodes the little endian status word at the start of a probe response.
    pub fn from_response(response: &[u8]) -> Status {
        match response {
            [lo, hi, ..] => Status::from(u16::from_le_bytes([*lo, *hi])),
            [lo] => Status::from(u16::from(*lo)),
            [] => Status::Other(0),
        }
    }

    /// Returns the raw status code as sent by the probe.
    pub fn code(&self) -> u16 {
        match self {
            Self::JtagOk => 0x80,
            Self::JtagUnknownError => 0x01,
            Self::JtagSpiError => 0x02,
            Self::JtagDmaError => 0x03,
            Self::JtagUnknownJtagChain => 0x04,
            Self::JtagNoDeviceConnected => 0x05,
            Self::JtagInternalError => 0x06,
            Self::JtagCmdWait => 0x07,
            Self::JtagCmdError => 0x08,
            Self::JtagGetIdcodeError => 0x09,
            Self::JtagAlignmentError => 0x0A,
            Self::JtagDbgPowerError => 0x0B,
            Self::JtagWriteError => 0x0C,
            Self::JtagWriteVerifError => 0x0D,
            Self::JtagAlreadyOpenedInOtherMode => 0x0E,
            Self::SwdApWait => 0x10,
            Self::SwdApFault => 0x11,
            Self::SwdApError => 0x12,
            Self::SwdApParityError => 0x13,
            Self::SwdDpWait => 0x14,
            Self::SwdDpFault => 0x15,
            Self::SwdDpError => 0x16,
            Self::SwdDpParityError => 0x17,
            Self::SwdApWdataError => 0x18,
            Self::SwdApStickyError => 0x19,
            Self::SwdApStickyorunError => 0x1A,
            Self::SwdApAlreadyUsed => 0x1B,
            Self::SwdTraceApTurnaround => 0x1C,
            Self::BadAp => 0x1D,
            Self::SwvNotAvailable => 0x20,
            Self::JtagNoJumpToLoader => 0x21,
            Self::JtagTcpError => 0x30,
            Self::JtagTcpBusy => 0x31,
            Self::JtagConfChanged => 0x40,
            Self::JtagFreqNotSupported => 0x41,
            Self::JtagUnknownCmd => 0x42,
            Self::JtagOldError => 0x81,
            Self::Other(v) => *v,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::JtagOk
    }

    /// Sorts the status into success, busy, protocol failure or bus failure.
    pub fn class(&self) -> StatusClass {
        match self {
            Self::JtagOk => StatusClass::Ok,
            Self::JtagCmdWait | Self::SwdApWait | Self::SwdDpWait | Self::JtagTcpBusy => {
                StatusClass::Wait
            }
            Self::JtagAlignmentError
            | Self::JtagDbgPowerError
            | Self::JtagWriteError
            | Self::JtagWriteVerifError
            | Self::SwdApFault
            | Self::SwdApError
            | Self::SwdDpFault
            | Self::SwdDpError
            | Self::SwdApWdataError
            | Self::SwdApStickyError
            | Self::SwdApStickyorunError => StatusClass::TargetBus,
            _ => StatusClass::Protocol,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Status, StatusClass};
    use test_case::test_case;

    #[test_case(0x80, StatusClass::Ok; "ok")]
    #[test_case(0x07, StatusClass::Wait; "command wait")]
    #[test_case(0x10, StatusClass::Wait; "ap wait")]
    #[test_case(0x14, StatusClass::Wait; "dp wait")]
    #[test_case(0x11, StatusClass::TargetBus; "ap fault")]
    #[test_case(0x0a, StatusClass::TargetBus; "alignment")]
    #[test_case(0x41, StatusClass::Protocol; "frequency not supported")]
    #[test_case(0x1234, StatusClass::Protocol; "unknown code")]
    fn classifies_status(code: u16, class: StatusClass) {
        assert_eq!(Status::from(code).class(), class);
    }

    #[test]
    fn code_survives_decoding() {
        for code in 0..=0xffu16 {
            assert_eq!(Status::from(code).code(), code);
        }
    }

    #[test]
    fn status_word_is_little_endian() {
        assert_eq!(Status::from_response(&[0x80, 0x00]), Status::JtagOk);
        assert_eq!(
            Status::from_response(&[0x05, 0x00, 0xff, 0xff]),
            Status::JtagNoDeviceConnected
        );
        assert_eq!(Status::from_response(&[0x80, 0x01]), Status::Other(0x180));
    }

    #[test]
    fn display_strings() {
        assert_eq!(Status::SwdApFault.to_string(), "access port fault (0x11)");
        assert_eq!(Status::Other(0x99).to_string(), "unknown status 0x0099");
    }
}
