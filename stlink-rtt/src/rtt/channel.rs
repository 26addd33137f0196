use crate::memory::MemoryInterface;
use crate::rtt::Error;
use scroll::{Pread, LE};
use std::collections::VecDeque;

/// Longest channel name read from the target, in bytes.
const MAX_NAME_LEN: usize = 64;

/// A channel descriptor as found in the control block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    number: usize,
    ptr: u32,
    name: String,
    buffer_ptr: u32,
    size: u32,
}

// Channels must follow this data layout when reading/writing memory in order to be compatible with
// the official RTT implementation.
//
// struct Channel {
//     const char *name; // Name of channel, pointer to null-terminated string. Optional.
//     char *buffer; // Pointer to buffer data
//     unsigned int size; // Size of data buffer. The actual capacity is one byte less.
//     unsigned int write; // Offset in data buffer of next byte to write.
//     unsigned int read; // Offset in data buffer of next byte to read.
//     // The low 2 bits of flags are used for blocking/non blocking modes, the rest are ignored.
//     unsigned int flags;
// }

impl Channel {
    // Size of the Channel struct in target memory in bytes
    pub(crate) const SIZE: usize = 24;

    // Offsets of fields in target memory in bytes
    const O_NAME: usize = 0;
    const O_BUFFER_PTR: usize = 4;
    const O_SIZE: usize = 8;
    const O_WRITE: usize = 12;
    const O_READ: usize = 16;
    const O_FLAGS: usize = 20;

    /// Parses the descriptor `mem` located at `ptr` and resolves its name.
    ///
    /// Channels the target has not set up yet (null buffer) are kept, so that channel numbers
    /// stay equal to their position in the table.
    pub(crate) fn parse<M: MemoryInterface + ?Sized>(
        memory: &mut M,
        number: usize,
        ptr: u32,
        mem: &[u8],
    ) -> Result<Channel, Error> {
        let field = |offset: usize| -> Result<u32, Error> {
            mem.pread_with(offset, LE).map_err(|_| {
                Error::ControlBlockCorrupted(format!(
                    "descriptor of channel {number} at {ptr:#010x} is truncated"
                ))
            })
        };

        let name_ptr = field(Self::O_NAME)?;
        let buffer_ptr = field(Self::O_BUFFER_PTR)?;
        let size = field(Self::O_SIZE)?;

        let name = if name_ptr == 0 {
            String::new()
        } else {
            read_c_string(memory, name_ptr)?
        };

        let channel = Channel {
            number,
            ptr,
            name,
            buffer_ptr,
            size,
        };

        if channel.is_initialized() {
            tracing::debug!(
                "Channel {} {:?}: buffer {:#010x}, {} bytes",
                number,
                channel.name,
                buffer_ptr,
                size
            );
        } else {
            tracing::debug!("Buffer for channel {} not initialized", number);
        }

        Ok(channel)
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// Returns the name of the channel, empty if the target gave it none.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the descriptor in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn buffer_ptr(&self) -> u32 {
        self.buffer_ptr
    }

    /// Returns the buffer size in bytes. Note that the usable size is one byte less due to how the
    /// ring buffer is implemented.
    pub fn buffer_size(&self) -> usize {
        self.size as usize
    }

    pub fn write_offset_address(&self) -> u32 {
        self.ptr + Self::O_WRITE as u32
    }

    pub fn read_offset_address(&self) -> u32 {
        self.ptr + Self::O_READ as u32
    }

    pub fn flags_address(&self) -> u32 {
        self.ptr + Self::O_FLAGS as u32
    }

    /// Whether the target has attached a buffer to this channel.
    pub fn is_initialized(&self) -> bool {
        self.buffer_ptr != 0 && self.size != 0
    }

    /// Reads the write and read offsets from a copy of this channel's descriptor.
    pub(crate) fn offsets(&self, descriptor: &[u8], dir: &'static str) -> Result<(u32, u32), Error> {
        let field = |offset: usize| -> Result<u32, Error> {
            descriptor.pread_with(offset, LE).map_err(|_| {
                Error::ControlBlockCorrupted(format!(
                    "descriptor of {dir} channel {} is truncated",
                    self.number
                ))
            })
        };

        let write = field(Self::O_WRITE)?;
        let read = field(Self::O_READ)?;

        let validate = |which, value| {
            if value >= self.size {
                Err(Error::ControlBlockCorrupted(format!(
                    "{} pointer is {} while buffer size is {} for {:?} channel {} ({})",
                    which,
                    value,
                    self.size,
                    dir,
                    self.number,
                    if self.name.is_empty() {
                        "no name"
                    } else {
                        self.name.as_str()
                    },
                )))
            } else {
                Ok(())
            }
        };

        validate("write", write)?;
        validate("read", read)?;

        Ok((write, read))
    }
}

/// Number of bytes waiting in a ring of `size` bytes.
pub fn readable(size: u32, write: u32, read: u32) -> u32 {
    if read <= write {
        write - read
    } else {
        size - read + write
    }
}

/// Number of bytes that can be added to a ring of `size` bytes.
///
/// One byte always stays free, so that equal offsets mean the ring is empty.
pub fn available_to_write(size: u32, write: u32, read: u32) -> u32 {
    if read <= write {
        size - 1 - write + read
    } else {
        read - write - 1
    }
}

/// RTT up (target to host) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpChannel(pub(crate) Channel);

impl UpChannel {
    pub fn channel(&self) -> &Channel {
        &self.0
    }

    /// Returns the number of the channel.
    pub fn number(&self) -> usize {
        self.0.number
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn buffer_size(&self) -> usize {
        self.0.buffer_size()
    }

    /// Takes the bytes between `read` and `write` out of a copy of the whole ring.
    ///
    /// Returns the bytes in order and the new read offset.
    pub(crate) fn drain(&self, buffer: &[u8], write: u32, mut read: u32) -> (Vec<u8>, u32) {
        let mut data = Vec::with_capacity(readable(self.0.size, write, read) as usize);

        while read != write {
            data.push(buffer[read as usize]);
            read += 1;
            if read == self.0.size {
                // Wrap around to start
                read = 0;
            }
        }

        (data, read)
    }
}

/// RTT down (host to target) channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownChannel(pub(crate) Channel);

impl DownChannel {
    pub fn channel(&self) -> &Channel {
        &self.0
    }

    /// Returns the number of the channel.
    pub fn number(&self) -> usize {
        self.0.number
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn buffer_size(&self) -> usize {
        self.0.buffer_size()
    }

    /// Moves `count` bytes from the front of `pending` into the ring copy `shadow`, starting at
    /// `write`.
    ///
    /// Returns the new write offset.
    pub(crate) fn fill(
        &self,
        shadow: &mut [u8],
        pending: &mut VecDeque<u8>,
        mut write: u32,
        count: usize,
    ) -> u32 {
        for byte in pending.drain(..count) {
            shadow[write as usize] = byte;
            write += 1;
            if write == self.0.size {
                // Wrap around to start
                write = 0;
            }
        }

        write
    }
}

/// Reads a null-terminated string of at most 64 bytes from target memory. Every byte becomes
/// the `char` of the same value.
///
/// Without a terminator, all 64 bytes make up the name.
fn read_c_string<M: MemoryInterface + ?Sized>(memory: &mut M, ptr: u32) -> Result<String, Error> {
    let bytes = memory.read(ptr, MAX_NAME_LEN)?;

    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());

    Ok(bytes[..end].iter().map(|&b| char::from(b)).collect())
}

#[cfg(test)]
mod test {
    use super::{available_to_write, readable, Channel, DownChannel, UpChannel};
    use crate::rtt::Error;
    use crate::test::MockMemory;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use test_case::test_case;

    fn descriptor(name_ptr: u32, buffer_ptr: u32, size: u32, write: u32, read: u32) -> Vec<u8> {
        [name_ptr, buffer_ptr, size, write, read, 0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    fn channel(size: u32) -> Channel {
        Channel {
            number: 0,
            ptr: 0x2000_0018,
            name: "Terminal".to_string(),
            buffer_ptr: 0x2000_0100,
            size,
        }
    }

    #[test]
    fn capacity_is_one_less_than_size() {
        for size in [1, 2, 3, 16, 17] {
            for write in 0..size {
                for read in 0..size {
                    assert_eq!(
                        readable(size, write, read) + available_to_write(size, write, read),
                        size - 1,
                        "size {size}, write {write}, read {read}"
                    );
                }
            }
        }
    }

    #[test_case(8, 3, 3, 7; "empty")]
    #[test_case(8, 2, 3, 0; "full")]
    #[test_case(8, 7, 0, 0; "full at the end")]
    #[test_case(8, 5, 1, 3; "partly filled")]
    fn free_space(size: u32, write: u32, read: u32, free: u32) {
        assert_eq!(available_to_write(size, write, read), free);
    }

    #[test]
    fn drain_wraps_around() {
        let up = UpChannel(channel(8));
        let ring = [0, 1, 2, 3, 4, 5, 6, 7];

        let (data, read) = up.drain(&ring, 2, 6);

        assert_eq!(data, vec![6, 7, 0, 1]);
        assert_eq!(read, 2);
    }

    #[test]
    fn drain_empty_ring() {
        let up = UpChannel(channel(8));

        let (data, read) = up.drain(&[0; 8], 5, 5);

        assert!(data.is_empty());
        assert_eq!(read, 5);
    }

    #[test]
    fn fill_is_fifo_and_wraps() {
        let down = DownChannel(channel(4));
        let mut shadow = vec![0; 4];
        let mut pending = VecDeque::from(vec![b'a', b'b', b'c', b'd']);

        let write = down.fill(&mut shadow, &mut pending, 2, 3);

        assert_eq!(shadow, vec![b'c', 0, b'a', b'b']);
        assert_eq!(write, 1);
        assert_eq!(pending, VecDeque::from(vec![b'd']));
    }

    #[test]
    fn offsets_are_validated() {
        let channel = channel(16);

        assert_eq!(
            channel.offsets(&descriptor(0, 0, 16, 15, 0), "up").unwrap(),
            (15, 0)
        );
        assert!(matches!(
            channel.offsets(&descriptor(0, 0, 16, 16, 0), "up"),
            Err(Error::ControlBlockCorrupted(_))
        ));
        assert!(matches!(
            channel.offsets(&descriptor(0, 0, 16, 0, 20), "up"),
            Err(Error::ControlBlockCorrupted(_))
        ));
    }

    #[test]
    fn names_are_nul_terminated() {
        let mut memory = MockMemory::new().with_ram(0x2000_0000, 0x100);
        memory.store(0x2000_0080, b"Terminal\0garbage");

        let channel = Channel::parse(
            &mut memory,
            0,
            0x2000_0018,
            &descriptor(0x2000_0080, 0x2000_0400, 16, 0, 0),
        )
        .unwrap();

        assert_eq!(channel.name(), "Terminal");
        assert_eq!(memory.reads, vec![(0x2000_0080, 64)]);
    }

    #[test]
    fn unterminated_name_uses_the_whole_window() {
        let mut memory = MockMemory::new().with_ram(0x2000_0000, 0x100);
        memory.store(0x2000_0000, &[b'x'; 0x100]);

        let channel = Channel::parse(
            &mut memory,
            0,
            0x2000_0018,
            &descriptor(0x2000_0010, 0x2000_0400, 16, 0, 0),
        )
        .unwrap();

        assert_eq!(channel.name(), "x".repeat(64));
    }

    #[test]
    fn high_name_bytes_map_to_chars() {
        let mut memory = MockMemory::new().with_ram(0x2000_0000, 0x100);
        memory.store(0x2000_0080, &[b'T', 0xb0, 0xff, b'!', 0]);

        let channel = Channel::parse(
            &mut memory,
            0,
            0x2000_0018,
            &descriptor(0x2000_0080, 0x2000_0400, 16, 0, 0),
        )
        .unwrap();

        assert_eq!(channel.name(), "T\u{b0}\u{ff}!");
        assert_eq!(channel.name().chars().count(), 4);
    }

    #[test]
    fn null_name_pointer_reads_nothing() {
        let mut memory = MockMemory::new();

        let channel =
            Channel::parse(&mut memory, 1, 0x2000_0030, &descriptor(0, 0, 0, 0, 0)).unwrap();

        assert_eq!(channel.name(), "");
        assert!(!channel.is_initialized());
        assert!(memory.reads.is_empty());
    }
}
