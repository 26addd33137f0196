//! Host side implementation of the RTT (Real-Time Transfer) I/O protocol over an ST-Link.
//!
//! RTT implements input and output to/from a microcontroller using in-memory ring buffers and
//! memory polling. This enables debug logging from the microcontroller with minimal delays and no
//! blocking, making it usable even in real-time applications where e.g. semihosting delays cannot
//! be tolerated.
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::VecDeque;
//! use stlink_rtt::config::{ProbeConfig, RttConfig};
//! use stlink_rtt::probe::stlink::{tools::list_stlink_devices, StLink};
//! use stlink_rtt::rtt::Rtt;
//!
//! let probes = list_stlink_devices();
//! let mut probe = StLink::new_from_info(&probes[0], &ProbeConfig::default())?;
//! probe.open()?;
//!
//! // Attach to RTT
//! let Some(mut rtt) = Rtt::find(&mut probe, &RttConfig::default())? else {
//!     println!("No RTT control block found");
//!     return Ok(());
//! };
//!
//! // Read from the terminal channel
//! let data = rtt.read(&mut probe)?;
//! println!("Read data: {:?}", data);
//!
//! // Write to the terminal channel
//! let mut pending = VecDeque::from(b"Hello, computer!\n".to_vec());
//! rtt.write(&mut probe, &mut pending)?;
//!
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod channel;
pub mod poll;

pub use channel::{available_to_write, readable, Channel, DownChannel, UpChannel};

use crate::config::{RamRegion, RttConfig};
use crate::memory::MemoryInterface;
use crate::probe::stlink::usb_interface::StLinkUsb;
use crate::probe::stlink::{StLink, StlinkError};
use crate::probe::DebugProbeError;
use scroll::{Pread, LE};
use std::borrow::Cow;
use std::collections::VecDeque;

/// The RTT interface.
///
/// Use [`Rtt::find`] to locate the control block through a probe, or [`Rtt::scan`] to look for
/// it through any [`MemoryInterface`]. Only channel 0 of each direction is used for data
/// transfer, the other channels are listed for information.
///
/// The control block must have been set up by the target before it is searched for. If the target
/// has not run its RTT initialization yet, no control block is found, or one left behind by a
/// previous program is, whose channel names and buffer sizes may no longer be valid.
#[derive(Debug)]
pub struct Rtt {
    /// The location of the control block in target memory.
    ptr: u32,

    /// The STM32 device id, when the device could be identified.
    mcu_id: Option<u16>,

    /// The up (target to host) channels, initialized or not.
    up_channels: Vec<UpChannel>,

    /// The down (host to target) channels, initialized or not.
    down_channels: Vec<DownChannel>,

    /// Raw copy of both descriptor tables. `None` when it has to be read again.
    snapshot: Option<Vec<u8>>,

    /// Host copy of the whole down channel 0 ring.
    shadow: Vec<u8>,
}

// Rtt must follow this data layout when reading/writing memory in order to be compatible with the
// official RTT implementation.
//
// struct ControlBlock {
//     char id[16]; // Used to find/validate the control block.
//     // Maximum number of up (target to host) channels in following array
//     unsigned int max_up_channels;
//     // Maximum number of down (host to target) channels in following array.
//     unsigned int max_down_channels;
//     RttChannel up_channels[max_up_channels]; // Array of up (target to host) channels.
//     RttChannel down_channels[max_down_channels]; // array of down (host to target) channels.
// }
impl Rtt {
    /// The magic string expected to be found at the beginning of the RTT control block.
    pub const RTT_ID: [u8; 16] = *b"SEGGER RTT\0\0\0\0\0\0";

    const RTT_ID_LO: u64 = u64::from_le_bytes(*b"SEGGER R");
    const RTT_ID_HI: u64 = u64::from_le_bytes(*b"TT\0\0\0\0\0\0");

    const O_MAX_UP_CHANNELS: usize = 16;
    const O_MAX_DOWN_CHANNELS: usize = 20;
    const HEADER_SIZE: usize = 24;

    /// Enters SWD mode, identifies the device and scans the configured RAM window for the
    /// control block.
    ///
    /// Returns `Ok(None)` when the window holds no control block, which means RTT is not
    /// available on the target.
    pub fn find<D: StLinkUsb>(
        probe: &mut StLink<D>,
        config: &RttConfig,
    ) -> Result<Option<Rtt>, Error> {
        probe.enter_swd()?;

        let mcu_id = match probe.read_mcu_id() {
            Ok(Some(mcu_id)) => {
                tracing::debug!("Found MCU with id {:#05x}", mcu_id);
                Some(mcu_id)
            }
            Ok(None) => {
                tracing::warn!("Could not identify the MCU, using the configured RAM window");
                None
            }
            Err(DebugProbeError::StLink(StlinkError::UnsupportedDesigner(designer))) => {
                tracing::warn!(
                    "Debug port designer {:#05x} is not ARM, using the configured RAM window",
                    designer
                );
                None
            }
            Err(error) => return Err(error.into()),
        };

        let rtt = Self::scan(probe, config.ram)?;

        Ok(rtt.map(|rtt| Rtt { mcu_id, ..rtt }))
    }

    /// Reads `region` once and attaches to the first control block found in it.
    pub fn scan<M: MemoryInterface + ?Sized>(
        memory: &mut M,
        region: RamRegion,
    ) -> Result<Option<Rtt>, Error> {
        tracing::debug!(
            "Scanning {} bytes at {:#010x} for the RTT control block",
            region.size,
            region.address
        );

        let window = memory.read(region.address, region.size as usize)?;

        let Some(offset) = find_signature(&window) else {
            tracing::debug!("No RTT control block found");
            return Ok(None);
        };

        let ptr = offset_ptr(region.address, offset)?;
        tracing::debug!("RTT control block found at {:#010x}", ptr);

        Self::attach_at(memory, ptr, &window[offset..]).map(Some)
    }

    /// Parses the control block at `ptr`. `cached` holds target memory starting at `ptr`, as much
    /// of it as was scanned; anything beyond is read from the target.
    fn attach_at<M: MemoryInterface + ?Sized>(
        memory: &mut M,
        ptr: u32,
        cached: &[u8],
    ) -> Result<Rtt, Error> {
        let header = bytes_at(memory, cached, ptr, 0, Self::HEADER_SIZE)?;

        let max_up_channels = word(&header, Self::O_MAX_UP_CHANNELS)? as usize;
        let max_down_channels = word(&header, Self::O_MAX_DOWN_CHANNELS)? as usize;

        // *Very* conservative sanity check, most people only use a handful of RTT channels
        if max_up_channels > 255 || max_down_channels > 255 {
            return Err(Error::ControlBlockCorrupted(format!(
                "Unexpected array sizes at {ptr:#010x}: max_up_channels={max_up_channels} max_down_channels={max_down_channels}"
            )));
        }

        let tables_ptr = offset_ptr(ptr, Self::HEADER_SIZE)?;
        let tables_len = (max_up_channels + max_down_channels) * Channel::SIZE;
        offset_ptr(tables_ptr, tables_len)?;

        let tables = bytes_at(memory, cached, ptr, Self::HEADER_SIZE, tables_len)?.into_owned();

        let descriptor = |index: usize| {
            let start = index * Channel::SIZE;
            (
                tables_ptr + start as u32,
                &tables[start..start + Channel::SIZE],
            )
        };

        let mut up_channels = Vec::with_capacity(max_up_channels);
        for number in 0..max_up_channels {
            let (channel_ptr, mem) = descriptor(number);
            up_channels.push(UpChannel(Channel::parse(memory, number, channel_ptr, mem)?));
        }

        let mut down_channels = Vec::with_capacity(max_down_channels);
        for number in 0..max_down_channels {
            let (channel_ptr, mem) = descriptor(max_up_channels + number);
            down_channels.push(DownChannel(Channel::parse(
                memory,
                number,
                channel_ptr,
                mem,
            )?));
        }

        Ok(Rtt {
            ptr,
            mcu_id: None,
            up_channels,
            down_channels,
            snapshot: Some(tables),
            shadow: Vec::new(),
        })
    }

    /// Returns the memory address of the control block in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Returns the STM32 device id read during [`Rtt::find`].
    pub fn mcu_id(&self) -> Option<u16> {
        self.mcu_id
    }

    /// Returns the detected up channels.
    pub fn up_channels(&self) -> &[UpChannel] {
        &self.up_channels
    }

    /// Returns the detected down channels.
    pub fn down_channels(&self) -> &[DownChannel] {
        &self.down_channels
    }

    /// Returns a particular up channel.
    pub fn up_channel(&self, channel: usize) -> Option<&UpChannel> {
        self.up_channels.get(channel)
    }

    /// Returns a particular down channel.
    pub fn down_channel(&self, channel: usize) -> Option<&DownChannel> {
        self.down_channels.get(channel)
    }

    fn tables_ptr(&self) -> u32 {
        self.ptr + Self::HEADER_SIZE as u32
    }

    fn tables_len(&self) -> usize {
        (self.up_channels.len() + self.down_channels.len()) * Channel::SIZE
    }

    /// Reads both descriptor tables again.
    fn refresh<M: MemoryInterface + ?Sized>(&mut self, memory: &mut M) -> Result<(), Error> {
        let tables = memory.read(self.tables_ptr(), self.tables_len())?;
        self.snapshot = Some(tables);
        Ok(())
    }

    /// The cached descriptor at position `index` of the combined tables.
    fn descriptor(&self, index: usize) -> Result<&[u8], Error> {
        let start = index * Channel::SIZE;

        self.snapshot
            .as_deref()
            .and_then(|tables| tables.get(start..start + Channel::SIZE))
            .ok_or_else(|| {
                Error::ControlBlockCorrupted(format!(
                    "descriptor {index} is missing from the cached control block"
                ))
            })
    }

    /// Takes all bytes the target has written to up channel 0 since the last call.
    ///
    /// This never waits for data: an empty result means the channel is idle. The read offset
    /// is only written back when something was consumed.
    pub fn read<M: MemoryInterface + ?Sized>(&mut self, memory: &mut M) -> Result<Vec<u8>, Error> {
        if self.up_channels.is_empty() {
            return Err(Error::MissingChannel(0));
        }

        self.refresh(memory)?;

        let up = &self.up_channels[0];
        if !up.channel().is_initialized() {
            tracing::trace!("Up channel 0 has no buffer");
            return Ok(vec![]);
        }

        let (write, read) = up.0.offsets(self.descriptor(0)?, "up")?;

        let size = up.buffer_size();
        let buffer = memory.read(up.0.buffer_ptr(), size)?;
        if buffer.len() != size {
            return Err(DebugProbeError::NotEnoughBytesRead {
                is: buffer.len(),
                should: size,
            }
            .into());
        }

        let (data, read) = up.drain(&buffer, write, read);

        if !data.is_empty() {
            // Write read pointer back to target if something was read
            memory.write_word_32(up.0.read_offset_address(), read)?;
            tracing::trace!("Read {} bytes from up channel 0", data.len());
        }

        Ok(data)
    }

    /// Moves as many bytes from the front of `pending` into down channel 0 as fit.
    ///
    /// Bytes that do not fit stay in `pending` for a later call. Returns how many bytes were
    /// sent. The whole ring is flushed from the host copy, then the write offset is updated.
    pub fn write<M: MemoryInterface + ?Sized>(
        &mut self,
        memory: &mut M,
        pending: &mut VecDeque<u8>,
    ) -> Result<usize, Error> {
        if self.down_channels.is_empty() {
            return Err(Error::MissingChannel(0));
        }

        if pending.is_empty() {
            return Ok(0);
        }

        if self.snapshot.is_none() {
            self.refresh(memory)?;
        }

        let down = &self.down_channels[0];
        if !down.channel().is_initialized() {
            tracing::trace!("Down channel 0 has no buffer");
            return Ok(0);
        }

        let (write, read) = down
            .0
            .offsets(self.descriptor(self.up_channels.len())?, "down")?;

        let size = down.buffer_size();
        let count = (available_to_write(size as u32, write, read) as usize).min(pending.len());
        if count == 0 {
            tracing::trace!("Down channel 0 is full");
            return Ok(0);
        }

        self.shadow.resize(size, 0);
        let write = down.fill(&mut self.shadow, pending, write, count);

        memory.write(down.0.buffer_ptr(), size, &self.shadow)?;
        memory.write_word_32(down.0.write_offset_address(), write)?;

        self.snapshot = None;

        tracing::trace!("Wrote {} bytes to down channel 0", count);

        Ok(count)
    }
}

/// Offset of the first RTT signature in `mem`.
///
/// Compares two 64-bit words per candidate offset.
fn find_signature(mem: &[u8]) -> Option<usize> {
    let last = mem.len().checked_sub(Rtt::RTT_ID.len())?;

    (0..=last).find(|&offset| {
        mem.pread_with::<u64>(offset, LE).ok() == Some(Rtt::RTT_ID_LO)
            && mem.pread_with::<u64>(offset + 8, LE).ok() == Some(Rtt::RTT_ID_HI)
    })
}

fn offset_ptr(ptr: u32, offset: usize) -> Result<u32, Error> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| ptr.checked_add(offset))
        .ok_or_else(|| {
            Error::ControlBlockCorrupted(format!(
                "control block at {ptr:#010x} runs past the end of the address space"
            ))
        })
}

fn word(mem: &[u8], offset: usize) -> Result<u32, Error> {
    mem.pread_with(offset, LE).map_err(|_| {
        Error::ControlBlockCorrupted(format!("control block header is truncated at {offset}"))
    })
}

/// `len` bytes at `ptr + offset`, from `cached` when it covers them.
fn bytes_at<'a, M: MemoryInterface + ?Sized>(
    memory: &mut M,
    cached: &'a [u8],
    ptr: u32,
    offset: usize,
    len: usize,
) -> Result<Cow<'a, [u8]>, Error> {
    if let Some(bytes) = cached.get(offset..offset + len) {
        return Ok(Cow::Borrowed(bytes));
    }

    let address = offset_ptr(ptr, offset)?;
    tracing::debug!(
        "Control block extends past the scanned window, reading {} bytes at {:#010x}",
        len,
        address
    );

    Ok(Cow::Owned(memory.read(address, len)?))
}

/// Error type for RTT operations.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// The control block has been corrupted: {0}
    ControlBlockCorrupted(String),

    /// Channel {0} does not exist.
    MissingChannel(usize),

    /// Error communicating with the probe.
    Probe(#[from] DebugProbeError),

    /// Could not pass RTT data to the host.
    Io(#[from] std::io::Error),
}
