//! Target memory access on top of alignment constrained probe primitives.
//!
//! The probe only moves width aligned, width bounded blocks. [`read_memory`] and
//! [`write_memory`] accept any address and any size and split the request into a
//! sequence of legal transfers:
//!
//! 1. an 8-bit transfer for the bytes before the first word boundary,
//! 2. 32-bit transfers of at most `max_transfer_size` bytes for the aligned middle,
//! 3. an 8-bit transfer for the remaining 0 to 3 bytes.

use crate::probe::stlink::StlinkError;
use crate::probe::DebugProbeError;

/// Largest 8-bit transfer the probe accepts, one full speed USB packet.
pub const MAX_8BIT_TRANSFER_SIZE: usize = 64;

/// Width of a single probe transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessWidth {
    Bit8,
    Bit16,
    Bit32,
}

impl AccessWidth {
    /// Width in bytes, which is also the required alignment.
    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::Bit8 => 1,
            AccessWidth::Bit16 => 2,
            AccessWidth::Bit32 => 4,
        }
    }
}

/// One primitive transfer of a larger access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Target address of the first byte.
    pub address: u32,
    /// Position of the first byte in the caller's buffer.
    pub offset: usize,
    /// Number of bytes moved.
    pub size: usize,
    pub width: AccessWidth,
}

/// Splits `size` bytes at `address` into the ordered list of transfers that covers them.
///
/// The chunks cover `address..address + size` exactly, in ascending order. Every chunk is
/// aligned to its width, 8-bit chunks are at most 3 bytes and 32-bit chunks are at most
/// `max_transfer_size` bytes.
pub fn plan_transfer(
    address: u32,
    size: usize,
    max_transfer_size: usize,
) -> Result<Vec<Chunk>, StlinkError> {
    if max_transfer_size < 4 || max_transfer_size % 4 != 0 {
        return Err(StlinkError::InvalidMaxTransferSize(max_transfer_size));
    }

    let mut chunks = Vec::new();

    if size == 0 {
        return Ok(chunks);
    }

    if u64::from(address) + size as u64 > 1 << 32 {
        return Err(StlinkError::AddressOverflow { address, size });
    }

    let prefix = match address % 4 {
        0 => 0,
        misalignment => size.min(4 - misalignment as usize),
    };
    let suffix = (size - prefix) % 4;
    let aligned_end = size - suffix;

    let chunk_at = |offset: usize, size: usize, width: AccessWidth| Chunk {
        address: address + offset as u32,
        offset,
        size,
        width,
    };

    if prefix > 0 {
        chunks.push(chunk_at(0, prefix, AccessWidth::Bit8));
    }

    let mut offset = prefix;
    while offset < aligned_end {
        let len = (aligned_end - offset).min(max_transfer_size);
        chunks.push(chunk_at(offset, len, AccessWidth::Bit32));
        offset += len;
    }

    if suffix > 0 {
        chunks.push(chunk_at(offset, suffix, AccessWidth::Bit8));
    }

    Ok(chunks)
}

/// The transfers a probe can carry out directly.
///
/// Implementations check alignment and size limits themselves and fail before
/// touching the transport when a request is not legal.
pub trait MemoryPrimitives {
    /// Largest 16- or 32-bit transfer in bytes.
    fn max_transfer_size(&self) -> usize;

    fn read_8(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError>;

    fn read_16(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError>;

    fn read_32(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError>;

    fn write_8(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError>;

    fn write_16(&mut self, address: u32, size: usize, data: &[u8])
        -> Result<(), DebugProbeError>;

    fn write_32(&mut self, address: u32, size: usize, data: &[u8])
        -> Result<(), DebugProbeError>;
}

/// Reads `size` bytes starting at any `address`.
///
/// A zero sized read returns an empty buffer without talking to the probe. The first
/// failing transfer aborts the whole read.
pub fn read_memory<P: MemoryPrimitives + ?Sized>(
    probe: &mut P,
    address: u32,
    size: usize,
) -> Result<Vec<u8>, DebugProbeError> {
    let chunks = plan_transfer(address, size, probe.max_transfer_size())?;

    tracing::debug!(
        "Reading {} bytes at {:#010x} in {} transfers",
        size,
        address,
        chunks.len()
    );

    let mut data = Vec::with_capacity(size);

    for chunk in chunks {
        let bytes = match chunk.width {
            AccessWidth::Bit8 => probe.read_8(chunk.address, chunk.size)?,
            AccessWidth::Bit16 => probe.read_16(chunk.address, chunk.size)?,
            AccessWidth::Bit32 => probe.read_32(chunk.address, chunk.size)?,
        };

        if bytes.len() != chunk.size {
            return Err(DebugProbeError::NotEnoughBytesRead {
                is: bytes.len(),
                should: chunk.size,
            });
        }

        data.extend_from_slice(&bytes);
    }

    Ok(data)
}

/// Writes the first `size` bytes of `data` starting at any `address`.
///
/// `data` may be longer than `size`, the excess is ignored. A shorter buffer is rejected
/// before anything is sent.
pub fn write_memory<P: MemoryPrimitives + ?Sized>(
    probe: &mut P,
    address: u32,
    size: usize,
    data: &[u8],
) -> Result<(), DebugProbeError> {
    if data.len() < size {
        return Err(StlinkError::BufferTooShort {
            is: data.len(),
            should: size,
        }
        .into());
    }

    let data = &data[..size];
    let chunks = plan_transfer(address, size, probe.max_transfer_size())?;

    tracing::debug!(
        "Writing {} bytes at {:#010x} in {} transfers",
        size,
        address,
        chunks.len()
    );

    for chunk in chunks {
        let bytes = &data[chunk.offset..][..chunk.size];

        match chunk.width {
            AccessWidth::Bit8 => probe.write_8(chunk.address, chunk.size, bytes)?,
            AccessWidth::Bit16 => probe.write_16(chunk.address, chunk.size, bytes)?,
            AccessWidth::Bit32 => probe.write_32(chunk.address, chunk.size, bytes)?,
        }
    }

    Ok(())
}

/// Byte oriented access to target memory.
pub trait MemoryInterface {
    /// Reads `size` bytes at `address`. No alignment requirements.
    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError>;

    /// Writes the first `size` bytes of `data` to `address`. No alignment requirements.
    fn write(&mut self, address: u32, size: usize, data: &[u8]) -> Result<(), DebugProbeError>;

    /// Reads a little endian word. Aligned addresses take a single 32-bit transfer.
    fn read_word_32(&mut self, address: u32) -> Result<u32, DebugProbeError> {
        let bytes = self.read(address, 4)?;
        let word: [u8; 4] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| DebugProbeError::NotEnoughBytesRead {
                    is: bytes.len(),
                    should: 4,
                })?;

        Ok(u32::from_le_bytes(word))
    }

    /// Writes a little endian word. Aligned addresses take a single 32-bit transfer.
    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), DebugProbeError> {
        self.write(address, 4, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::{
        plan_transfer, read_memory, write_memory, AccessWidth, Chunk, MemoryPrimitives,
        MAX_8BIT_TRANSFER_SIZE,
    };
    use crate::probe::stlink::{constants::Status, StlinkError};
    use crate::probe::{DebugProbeError, ErrorKind};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    /// Primitive transfers against a flat RAM that enforce the probe rules and log every call.
    struct RecordingProbe {
        base: u32,
        ram: Vec<u8>,
        max_transfer_size: usize,
        calls: Vec<(AccessWidth, u32, usize)>,
        fail_on_call: Option<usize>,
    }

    impl RecordingProbe {
        fn new(base: u32, len: usize, max_transfer_size: usize) -> Self {
            Self {
                base,
                ram: (0..len).map(|i| i as u8).collect(),
                max_transfer_size,
                calls: Vec::new(),
                fail_on_call: None,
            }
        }

        fn access(
            &mut self,
            width: AccessWidth,
            address: u32,
            size: usize,
        ) -> Result<usize, DebugProbeError> {
            let max = match width {
                AccessWidth::Bit8 => MAX_8BIT_TRANSFER_SIZE,
                _ => self.max_transfer_size,
            };
            assert!(size > 0 && size <= max, "illegal size {size} for {width:?}");
            assert_eq!(address as usize % width.bytes(), 0, "unaligned {width:?}");
            assert_eq!(size % width.bytes(), 0, "unaligned size for {width:?}");

            if self.fail_on_call == Some(self.calls.len()) {
                return Err(StlinkError::TransferFault {
                    status: Status::SwdApFault,
                    address,
                }
                .into());
            }

            self.calls.push((width, address, size));
            Ok((address - self.base) as usize)
        }
    }

    impl MemoryPrimitives for RecordingProbe {
        fn max_transfer_size(&self) -> usize {
            self.max_transfer_size
        }

        fn read_8(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
            let start = self.access(AccessWidth::Bit8, address, size)?;
            Ok(self.ram[start..start + size].to_vec())
        }

        fn read_16(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
            let start = self.access(AccessWidth::Bit16, address, size)?;
            Ok(self.ram[start..start + size].to_vec())
        }

        fn read_32(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DebugProbeError> {
            let start = self.access(AccessWidth::Bit32, address, size)?;
            Ok(self.ram[start..start + size].to_vec())
        }

        fn write_8(
            &mut self,
            address: u32,
            size: usize,
            data: &[u8],
        ) -> Result<(), DebugProbeError> {
            let start = self.access(AccessWidth::Bit8, address, size)?;
            self.ram[start..start + size].copy_from_slice(&data[..size]);
            Ok(())
        }

        fn write_16(
            &mut self,
            address: u32,
            size: usize,
            data: &[u8],
        ) -> Result<(), DebugProbeError> {
            let start = self.access(AccessWidth::Bit16, address, size)?;
            self.ram[start..start + size].copy_from_slice(&data[..size]);
            Ok(())
        }

        fn write_32(
            &mut self,
            address: u32,
            size: usize,
            data: &[u8],
        ) -> Result<(), DebugProbeError> {
            let start = self.access(AccessWidth::Bit32, address, size)?;
            self.ram[start..start + size].copy_from_slice(&data[..size]);
            Ok(())
        }
    }

    #[test]
    fn chunks_cover_range_exactly() {
        for max_transfer_size in [4, 8, 256, 6144] {
            for address in 0x2000_0000..0x2000_0008u32 {
                for size in (0..300).chain([1023, 1024, 1025, 6144, 6150, 20000]) {
                    let chunks = plan_transfer(address, size, max_transfer_size).unwrap();

                    let mut next_address = address;
                    let mut next_offset = 0;

                    for chunk in &chunks {
                        assert_eq!(chunk.address, next_address);
                        assert_eq!(chunk.offset, next_offset);
                        assert!(chunk.size > 0);
                        assert_eq!(chunk.address as usize % chunk.width.bytes(), 0);
                        assert_eq!(chunk.size % chunk.width.bytes(), 0);

                        match chunk.width {
                            AccessWidth::Bit8 => assert!(chunk.size <= 3),
                            AccessWidth::Bit32 => assert!(chunk.size <= max_transfer_size),
                            AccessWidth::Bit16 => panic!("16-bit transfers are never planned"),
                        }

                        next_address += chunk.size as u32;
                        next_offset += chunk.size;
                    }

                    assert_eq!(next_offset, size);
                }
            }
        }
    }

    #[test]
    fn unaligned_plan() {
        let chunks = plan_transfer(0x2000_0003, 263, 256).unwrap();

        assert_eq!(
            chunks,
            vec![
                Chunk {
                    address: 0x2000_0003,
                    offset: 0,
                    size: 1,
                    width: AccessWidth::Bit8,
                },
                Chunk {
                    address: 0x2000_0004,
                    offset: 1,
                    size: 256,
                    width: AccessWidth::Bit32,
                },
                Chunk {
                    address: 0x2000_0104,
                    offset: 257,
                    size: 4,
                    width: AccessWidth::Bit32,
                },
                Chunk {
                    address: 0x2000_0108,
                    offset: 261,
                    size: 2,
                    width: AccessWidth::Bit8,
                },
            ]
        );
    }

    #[test]
    fn short_unaligned_access_stays_in_prefix() {
        let chunks = plan_transfer(0x2000_0001, 2, 256).unwrap();

        assert_eq!(
            chunks,
            vec![Chunk {
                address: 0x2000_0001,
                offset: 0,
                size: 2,
                width: AccessWidth::Bit8,
            }]
        );
    }

    #[test]
    fn access_ending_at_top_of_address_space() {
        let chunks = plan_transfer(0xffff_fffa, 6, 256).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].address, 0xffff_fffc);

        let error = plan_transfer(0xffff_fffa, 7, 256).unwrap_err();
        assert!(matches!(error, StlinkError::AddressOverflow { .. }));
    }

    #[test_case(0; "zero")]
    #[test_case(6; "not a multiple of four")]
    fn invalid_max_transfer_size(max_transfer_size: usize) {
        let error = plan_transfer(0, 4, max_transfer_size).unwrap_err();
        assert!(matches!(error, StlinkError::InvalidMaxTransferSize(_)));
    }

    #[test]
    fn zero_size_is_a_no_op() {
        let mut probe = RecordingProbe::new(0x2000_0000, 64, 256);

        assert_eq!(read_memory(&mut probe, 0x2000_0001, 0).unwrap(), Vec::<u8>::new());
        write_memory(&mut probe, 0x2000_0001, 0, &[]).unwrap();

        assert!(probe.calls.is_empty());
    }

    #[test]
    fn read_reassembles_in_order() {
        let mut probe = RecordingProbe::new(0x2000_0000, 0x400, 16);

        let data = read_memory(&mut probe, 0x2000_0005, 40).unwrap();

        assert_eq!(data, (5..45).map(|i| i as u8).collect::<Vec<_>>());
        assert_eq!(
            probe.calls,
            vec![
                (AccessWidth::Bit8, 0x2000_0005, 3),
                (AccessWidth::Bit32, 0x2000_0008, 16),
                (AccessWidth::Bit32, 0x2000_0018, 16),
                (AccessWidth::Bit32, 0x2000_0028, 4),
                (AccessWidth::Bit8, 0x2000_002c, 1),
            ]
        );
    }

    #[test]
    fn write_truncates_oversized_buffer() {
        let mut probe = RecordingProbe::new(0x2000_0000, 16, 256);

        write_memory(&mut probe, 0x2000_0000, 2, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();

        assert_eq!(&probe.ram[..4], &[0xaa, 0xbb, 0x02, 0x03]);
    }

    #[test]
    fn write_rejects_short_buffer_before_any_transfer() {
        let mut probe = RecordingProbe::new(0x2000_0000, 16, 256);

        let error = write_memory(&mut probe, 0x2000_0000, 8, &[0; 7]).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(probe.calls.is_empty());
    }

    #[test]
    fn failing_chunk_aborts_the_access() {
        let mut probe = RecordingProbe::new(0x2000_0000, 0x100, 16);
        probe.fail_on_call = Some(1);

        let error = read_memory(&mut probe, 0x2000_0002, 64).unwrap_err();

        assert_eq!(error.fault_address(), Some(0x2000_0004));
        assert_eq!(probe.calls.len(), 1);
    }
}
