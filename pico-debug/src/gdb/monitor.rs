//! `qRcmd` monitor commands.

use super::reply::{reply_error, reply_hex, reply_ok};
use super::GdbServer;
use crate::io::GdbTransport;
use crate::swd::WireEngine;

const HELP_TEXT: &str = "Supported commands:\n\
    reset       - reset the current core and let it run\n\
    reset halt  - reset the current core and halt at the reset vector\n\
    get_to_main - run to main (needs the symbol from the host)\n";

/// Poll budget while waiting to arrive at main, roughly 400 ms.
const GET_TO_MAIN_POLLS: usize = 200;

impl<E: WireEngine, T: GdbTransport> GdbServer<E, T> {
    pub(super) fn handle_monitor(&mut self, cmd: &[u8]) {
        let cmd = String::from_utf8_lossy(cmd);
        tracing::debug!(cmd = %cmd, "monitor command");

        match cmd.trim() {
            "reset halt" => match self.target.reset_halt() {
                Ok(()) => reply_ok(&mut self.io),
                Err(e) => {
                    tracing::warn!("reset halt failed: {e}");
                    reply_error(&mut self.io, 1);
                }
            },
            "reset" => {
                let reset = self
                    .target
                    .reset_halt()
                    .and_then(|()| self.target.resume());
                match reset {
                    Ok(()) => reply_ok(&mut self.io),
                    Err(e) => {
                        tracing::warn!("reset failed: {e}");
                        reply_error(&mut self.io, 1);
                    }
                }
            }
            "get_to_main" => self.monitor_get_to_main(),
            _ => reply_hex(&mut self.io, HELP_TEXT.as_bytes()),
        }
    }

    /// Plant a temporary breakpoint on `main` (as resolved via
    /// `qSymbol`), run, and give the target a moment to get there.
    fn monitor_get_to_main(&mut self) {
        let Some(main_addr) = self.main_addr else {
            tracing::debug!("get_to_main without a resolved main symbol");
            reply_error(&mut self.io, 1);
            return;
        };

        let was_set = self.target.is_breakpoint_set(main_addr);
        if !was_set {
            if let Err(e) = self.target.breakpoint_set(main_addr) {
                tracing::warn!("could not place breakpoint on main: {e}");
                reply_error(&mut self.io, 1);
                return;
            }
        }

        let result = self.run_to_halt();

        if !was_set {
            if let Err(e) = self.target.breakpoint_clear(main_addr) {
                tracing::warn!("could not remove temporary breakpoint: {e}");
            }
        }

        match result {
            Ok(true) => reply_ok(&mut self.io),
            Ok(false) => {
                tracing::debug!("target did not reach main in time");
                reply_error(&mut self.io, 1);
            }
            Err(e) => {
                tracing::warn!("get_to_main failed: {e}");
                reply_error(&mut self.io, 1);
            }
        }
    }

    fn run_to_halt(&mut self) -> crate::Result<bool> {
        self.target.resume()?;
        for _ in 0..GET_TO_MAIN_POLLS {
            if self.target.is_halted()? {
                self.target.update_status()?;
                return Ok(true);
            }
            self.io.poll_wait();
        }
        // Out of patience; drag the core back so the session stays
        // consistent.
        self.target.halt()?;
        self.target.update_status()?;
        Ok(false)
    }
}
