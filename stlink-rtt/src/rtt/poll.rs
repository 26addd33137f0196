//! The continuous terminal loop on top of [`Rtt::read`] and [`Rtt::write`].

use super::{Error, Rtt};
use crate::memory::MemoryInterface;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// The host side of an RTT terminal.
pub trait RttIo {
    /// Receives bytes read from up channel 0.
    fn output(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Appends host input for down channel 0 to `pending`. Must not block.
    fn input(&mut self, pending: &mut VecDeque<u8>);
}

/// Polls channel 0 in both directions until `stop` is set.
///
/// `stop` is checked between iterations, so a transfer in flight always completes first. The
/// loop sleeps for `interval` whenever the target had nothing to send. A missing channel only
/// disables its direction: input is dropped without a down channel and nothing is read without
/// an up channel.
pub fn run<M, I>(
    rtt: &mut Rtt,
    memory: &mut M,
    io: &mut I,
    stop: &AtomicBool,
    interval: Duration,
) -> Result<(), Error>
where
    M: MemoryInterface + ?Sized,
    I: RttIo + ?Sized,
{
    let mut pending = VecDeque::new();
    let can_read = !rtt.up_channels().is_empty();
    let can_write = !rtt.down_channels().is_empty();

    if !can_read {
        tracing::warn!("The target has no up channel, there will be no output");
    }
    if !can_write {
        tracing::warn!("The target has no down channel, input will be ignored");
    }

    while !stop.load(Ordering::Relaxed) {
        let data = if can_read {
            rtt.read(memory)?
        } else {
            Vec::new()
        };
        if !data.is_empty() {
            io.output(&data)?;
        }

        io.input(&mut pending);
        if can_write {
            rtt.write(memory, &mut pending)?;
        } else {
            pending.clear();
        }

        if data.is_empty() {
            thread::sleep(interval);
        }
    }

    tracing::debug!("RTT polling stopped");

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{run, RttIo};
    use crate::config::RamRegion;
    use crate::rtt::Rtt;
    use crate::test::MockMemory;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const CB: u32 = 0x2000_0000;
    const UP_BUFFER: u32 = 0x2000_0100;
    const DOWN_BUFFER: u32 = 0x2000_0200;

    struct ScriptedIo<'a> {
        stop: &'a AtomicBool,
        output: Vec<u8>,
        input: Vec<u8>,
        polls: usize,
    }

    impl RttIo for ScriptedIo<'_> {
        fn output(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.output.extend_from_slice(data);
            Ok(())
        }

        fn input(&mut self, pending: &mut VecDeque<u8>) {
            pending.extend(self.input.drain(..));
            self.polls += 1;
            if self.polls == 3 {
                self.stop.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Address of down channel 0 in a control block with `up_channels` up channels.
    fn down_descriptor(up_channels: u32) -> u32 {
        CB + 24 + 24 * up_channels
    }

    fn target(up_channels: u32, down_channels: u32) -> MockMemory {
        let mut memory = MockMemory::new().with_ram(CB, 0x400);
        memory.store(CB, &Rtt::RTT_ID);
        memory.store_word(CB + 16, up_channels);
        memory.store_word(CB + 20, down_channels);
        if up_channels > 0 {
            // up 0: 16 byte buffer holding "hi"
            memory.store_word(CB + 24 + 4, UP_BUFFER);
            memory.store_word(CB + 24 + 8, 16);
            memory.store_word(CB + 24 + 12, 2);
            memory.store(UP_BUFFER, b"hi");
        }
        if down_channels > 0 {
            let down = down_descriptor(up_channels);
            memory.store_word(down + 4, DOWN_BUFFER);
            memory.store_word(down + 8, 16);
        }
        memory
    }

    fn region() -> RamRegion {
        RamRegion {
            address: CB,
            size: 0x100,
        }
    }

    #[test]
    fn forwards_both_directions_until_stopped() {
        let mut memory = target(1, 1);
        let mut rtt = Rtt::scan(&mut memory, region()).unwrap().unwrap();
        let stop = AtomicBool::new(false);
        let mut io = ScriptedIo {
            stop: &stop,
            output: vec![],
            input: b"ok\n".to_vec(),
            polls: 0,
        };

        run(&mut rtt, &mut memory, &mut io, &stop, Duration::ZERO).unwrap();

        assert_eq!(io.output, b"hi".to_vec());
        assert_eq!(io.polls, 3);
        assert_eq!(memory.load(DOWN_BUFFER, 3), b"ok\n".to_vec());
        assert_eq!(memory.load_word(CB + 48 + 12), 3);
    }

    #[test]
    fn stop_before_start_issues_no_transfers() {
        let mut memory = target(1, 1);
        let mut rtt = Rtt::scan(&mut memory, region()).unwrap().unwrap();
        memory.clear_log();
        let stop = AtomicBool::new(true);
        let mut io = ScriptedIo {
            stop: &stop,
            output: vec![],
            input: vec![],
            polls: 0,
        };

        run(&mut rtt, &mut memory, &mut io, &stop, Duration::ZERO).unwrap();

        assert!(memory.reads.is_empty());
        assert_eq!(io.polls, 0);
    }

    #[test]
    fn input_without_down_channel_is_dropped() {
        let mut memory = target(1, 0);
        let mut rtt = Rtt::scan(&mut memory, region()).unwrap().unwrap();
        let stop = AtomicBool::new(false);
        let mut io = ScriptedIo {
            stop: &stop,
            output: vec![],
            input: b"lost".to_vec(),
            polls: 0,
        };

        run(&mut rtt, &mut memory, &mut io, &stop, Duration::ZERO).unwrap();

        assert_eq!(io.output, b"hi".to_vec());
    }

    #[test]
    fn down_only_target_still_receives_input() {
        let mut memory = target(0, 1);
        let mut rtt = Rtt::scan(&mut memory, region()).unwrap().unwrap();
        let stop = AtomicBool::new(false);
        let mut io = ScriptedIo {
            stop: &stop,
            output: vec![],
            input: b"ok\n".to_vec(),
            polls: 0,
        };

        run(&mut rtt, &mut memory, &mut io, &stop, Duration::ZERO).unwrap();

        assert!(io.output.is_empty());
        assert_eq!(io.polls, 3);
        assert_eq!(memory.load(DOWN_BUFFER, 3), b"ok\n".to_vec());
        assert_eq!(memory.load_word(down_descriptor(0) + 12), 3);
    }
}
