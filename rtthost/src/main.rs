mod config;
mod logging;

use anyhow::{anyhow, Context};
use clap::Parser;
use std::collections::VecDeque;
use std::io::prelude::*;
use std::io::{stdin, stdout, Stdout};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use stlink_rtt::probe::stlink::{tools::list_stlink_devices, StLink};
use stlink_rtt::probe::DebugProbeInfo;
use stlink_rtt::rtt::poll::{self, RttIo};
use stlink_rtt::rtt::Rtt;

use crate::config::Config;
use crate::logging::LevelFilter;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rtthost",
    version,
    about = "Host program for debugging microcontrollers through an ST-Link using the RTT (real-time transfer) protocol."
)]
struct Opts {
    #[clap(long, help = "List the attached ST-Link probes and exit.")]
    list_probes: bool,

    #[clap(short, long, default_value = "0", help = "Number of the probe to use.")]
    probe: usize,

    #[clap(
        long,
        value_parser = parse_int::parse::<u32>,
        help = "Start of the RAM window to scan for the control block. Both decimal and hex are accepted."
    )]
    ram_start: Option<u32>,

    #[clap(
        long,
        value_parser = parse_int::parse::<u32>,
        help = "Size of the RAM window to scan for the control block. Both decimal and hex are accepted."
    )]
    ram_size: Option<u32>,

    #[clap(long, help = "Largest 32-bit memory transfer in bytes (multiple of 4, up to 6144).")]
    max_transfer_size: Option<usize>,

    #[clap(long, help = "Read settings from this TOML file.")]
    config: Option<PathBuf>,

    #[clap(short, long, help = "List RTT channels and exit.")]
    list: bool,

    #[clap(long, value_enum, help = "Log level, unless RUST_LOG is set.")]
    log_level: Option<LevelFilter>,
}

impl Opts {
    /// Command line flags take precedence over every configuration source.
    fn apply(&self, config: &mut Config) {
        if let Some(address) = self.ram_start {
            config.rtt.ram.address = address;
        }
        if let Some(size) = self.ram_size {
            config.rtt.ram.size = size;
        }
        if let Some(max_transfer_size) = self.max_transfer_size {
            config.probe.max_transfer_size = max_transfer_size;
        }
        if let Some(log_level) = self.log_level {
            config.general.log_level = Some(log_level);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut config = config::load(opts.config.as_deref())?;
    opts.apply(&mut config);

    logging::setup_logging(config.general.log_level);

    let probes = list_stlink_devices();

    if opts.list_probes {
        list_probes(stdout(), &probes)?;
        return Ok(());
    }

    if probes.is_empty() {
        return Err(anyhow!(
            "No ST-Link probes available. Make sure your probe is plugged in, supported and up-to-date."
        ));
    }

    let Some(probe_info) = probes.get(opts.probe) else {
        list_probes(std::io::stderr(), &probes)?;
        return Err(anyhow!("Probe {} does not exist.", opts.probe));
    };

    let mut probe =
        StLink::new_from_info(probe_info, &config.probe).context("Error creating probe")?;
    probe.open().context("Error opening probe")?;

    eprintln!("Attaching to RTT...");

    let Some(mut rtt) = Rtt::find(&mut probe, &config.rtt).context("Error attaching to RTT")?
    else {
        eprintln!(
            "RTT is not available: no control block in {} bytes at {:#010x}.",
            config.rtt.ram.size, config.rtt.ram.address
        );
        return Ok(());
    };

    eprintln!("Found control block at {:#010x}", rtt.ptr());
    if let Some(mcu_id) = rtt.mcu_id() {
        eprintln!("MCU id: {mcu_id:#05x}");
    }

    if opts.list {
        println!("Up channels:");
        list_channels(rtt.up_channels().iter().map(|c| c.channel()));

        println!("Down channels:");
        list_channels(rtt.down_channels().iter().map(|c| c.channel()));

        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("Error installing the signal handler")?;
    }

    let mut terminal = Terminal {
        stdout: stdout(),
        stdin: stdin_channel(),
    };

    poll::run(
        &mut rtt,
        &mut probe,
        &mut terminal,
        &stop,
        config.rtt.poll_interval,
    )
    .context("Error polling RTT")?;

    probe.exit_debug_mode()?;
    probe.close()?;

    Ok(())
}

fn list_probes(mut stream: impl Write, probes: &[DebugProbeInfo]) -> std::io::Result<()> {
    writeln!(stream, "Available probes:")?;

    for (i, probe) in probes.iter().enumerate() {
        writeln!(
            stream,
            "  {}: {} {}",
            i,
            probe.identifier,
            probe
                .serial_number
                .as_deref()
                .unwrap_or("(no serial number)")
        )?;
    }

    Ok(())
}

fn list_channels<'a>(channels: impl ExactSizeIterator<Item = &'a stlink_rtt::rtt::Channel>) {
    if channels.len() == 0 {
        println!("  (none)");
        return;
    }

    for chan in channels {
        println!(
            "  {}: {} (buffer size {}{})",
            chan.number(),
            if chan.name().is_empty() {
                "(no name)"
            } else {
                chan.name()
            },
            chan.buffer_size(),
            if chan.is_initialized() {
                ""
            } else {
                ", not initialized"
            },
        );
    }
}

/// Stdout for the up channel, stdin for the down channel.
struct Terminal {
    stdout: Stdout,
    stdin: Receiver<Vec<u8>>,
}

impl RttIo for Terminal {
    fn output(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stdout.write_all(data)?;
        self.stdout.flush()
    }

    fn input(&mut self, pending: &mut VecDeque<u8>) {
        while let Ok(bytes) = self.stdin.try_recv() {
            pending.extend(bytes);
        }
    }
}

fn stdin_channel() -> Receiver<Vec<u8>> {
    let (tx, rx) = channel();

    thread::spawn(move || {
        let mut buf = [0u8; 1024];

        loop {
            match stdin().read(&mut buf[..]) {
                Ok(0) => break,
                Ok(count) => {
                    if tx.send(buf[..count].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("Error reading from stdin, input disabled: {}", err);
                    break;
                }
            }
        }
    });

    rx
}
