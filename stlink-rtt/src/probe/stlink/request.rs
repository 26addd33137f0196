use super::constants::commands;

/// The USB Command packet size.
pub(crate) const CMD_LEN: usize = 16;

/// One command exchange with the probe.
///
/// A request is a zero padded 16 byte command header, an optional payload sent after
/// the header and the number of bytes the probe answers with. Some commands answer with
/// more bytes than the caller asked for, in which case the response is cut down to
/// `truncate_to` bytes after the transfer.
#[derive(Debug, Clone)]
pub(crate) struct Request<'a> {
    command: [u8; CMD_LEN],
    command_len: usize,
    data_out: &'a [u8],
    read_len: usize,
    truncate_to: Option<usize>,
}

impl<'a> Request<'a> {
    /// Starts a request with the given command class byte.
    pub fn new(opcode: u8) -> Self {
        let mut command = [0; CMD_LEN];
        command[0] = opcode;

        Self {
            command,
            command_len: 1,
            data_out: &[],
            read_len: 0,
            truncate_to: None,
        }
    }

    /// Starts a `JTAG_COMMAND` request with the given sub-opcode.
    pub fn jtag(sub_opcode: u8) -> Self {
        Self::new(commands::JTAG_COMMAND).with_u8(sub_opcode)
    }

    pub fn with_u8(self, value: u8) -> Self {
        self.with_bytes(&[value])
    }

    pub fn with_u16(self, value: u16) -> Self {
        self.with_bytes(&value.to_le_bytes())
    }

    pub fn with_u32(self, value: u32) -> Self {
        self.with_bytes(&value.to_le_bytes())
    }

    /// Appends `bytes` to the header. Headers are built from fixed field lists that fit into
    /// [`CMD_LEN`] bytes, anything beyond is dropped.
    fn with_bytes(mut self, bytes: &[u8]) -> Self {
        debug_assert!(
            self.command_len + bytes.len() <= CMD_LEN,
            "STLink command headers are limited to {CMD_LEN} bytes"
        );

        let end = (self.command_len + bytes.len()).min(CMD_LEN);
        let count = end - self.command_len;

        self.command[self.command_len..end].copy_from_slice(&bytes[..count]);
        self.command_len = end;
        self
    }

    /// Payload sent right after the command header.
    pub fn with_data_out(mut self, data: &'a [u8]) -> Self {
        self.data_out = data;
        self
    }

    /// Number of bytes the probe sends back.
    pub fn expect(mut self, len: usize) -> Self {
        self.read_len = len;
        self
    }

    /// Keep only the first `len` bytes of the response.
    pub fn truncate_to(mut self, len: usize) -> Self {
        self.truncate_to = Some(len);
        self
    }

    /// The full, zero padded command header.
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// The meaningful part of the header, for logging.
    pub fn header(&self) -> &[u8] {
        &self.command[..self.command_len]
    }

    /// Second header byte, the sub-opcode of `JTAG_COMMAND` requests.
    pub fn sub_opcode(&self) -> u8 {
        self.command[1]
    }

    pub fn data_out(&self) -> &[u8] {
        self.data_out
    }

    pub fn read_len(&self) -> usize {
        self.read_len
    }

    pub fn finish(&self, mut response: Vec<u8>) -> Vec<u8> {
        if let Some(len) = self.truncate_to {
            response.truncate(len);
        }
        response
    }
}
