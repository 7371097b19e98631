//! Debug-probe core for the RP2040.
//!
//! This crate is the heart of a two-wire (SWD) debug probe: a bit-accurate
//! wire transceiver, the DP/AP transaction layer with multidrop core
//! selection, a memory access layer, Cortex-M0+ debug control and a GDB
//! remote-serial-protocol server that ties it all together.
//!
//! The two hardware boundaries are traits so the stack can be driven by a
//! PIO engine and USB/TCP byte pumps on the probe itself, or by test
//! doubles on a host:
//!
//! - [`swd::WireEngine`] is the clocked bit engine on the debug bus.
//! - [`io::GdbTransport`] is the byte stream to the host debugger.
//!
//! ```no_run
//! # use pico_debug::{adi::Target, config::ProbeConfig, gdb::GdbServer};
//! # fn run(engine: impl pico_debug::swd::WireEngine, io: impl pico_debug::io::GdbTransport) {
//! let target = Target::new(engine, ProbeConfig::default());
//! let mut server = GdbServer::new(target, io);
//! loop {
//!     server.poll();
//! }
//! # }
//! ```

pub mod adi;
pub mod config;
pub mod cortex;
pub mod flash;
pub mod gdb;
pub mod io;
pub mod memory;
pub mod rp2040;
pub mod swd;

#[cfg(test)]
pub(crate) mod fake;

pub use crate::swd::SwdError;

/// The overarching error type for every operation against the target.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wire-level SWD transaction failed.
    #[error("SWD transaction failed")]
    Swd(#[from] SwdError),
    /// The CDBGPWRUPACK/CSYSPWRUPACK bits did not assert within the retry
    /// budget.
    #[error("debug domain power-up request was not acknowledged")]
    PowerUpFailed,
    /// DLPIDR did not match the TARGETSEL id after a multidrop select.
    #[error("core select failed: DLPIDR {dlpidr:#010x} does not match TARGETSEL {targetsel:#010x}")]
    CoreSelectFailed {
        /// The TARGETSEL value that was driven.
        targetsel: u32,
        /// The DLPIDR value read back.
        dlpidr: u32,
    },
    /// All four hardware breakpoint comparators are in use.
    #[error("no free hardware breakpoint comparator")]
    BreakpointUnavailable,
    /// A bootrom function tag was not present in the ROM table.
    #[error("bootrom function '{0}' not found")]
    RomFuncNotFound(&'static str),
    /// A routine invoked through the ROM trampoline did not come back to
    /// its end breakpoint in time.
    #[error("timed out waiting for a ROM routine to complete")]
    FlashTimeout,
}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
