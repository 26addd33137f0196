//! # stlink-rtt
//!
//! Target memory access and RTT terminals through ST-Link debug probes.
//!
//! The crate is layered the same way the data flows:
//!
//! * [`probe::stlink`] builds the ST-Link command frames, decodes status words and provides the
//!   width and alignment constrained memory transfers of the probe.
//! * [`memory`] turns those primitives into byte oriented reads and writes of any address and
//!   size.
//! * [`rtt`] finds the RTT control block in target RAM and moves data through the channel ring
//!   buffers while the target keeps running.
//!
//! All calls into a probe take `&mut self`, so a session never has more than one command in
//! flight.

pub mod config;
pub mod memory;
pub mod probe;
pub mod rtt;


pub use crate::config::{ProbeConfig, RamRegion, RttConfig};
pub use crate::memory::MemoryInterface;
pub use crate::probe::{DebugProbeError, DebugProbeInfo, ErrorKind};
pub use crate::rtt::Rtt;
