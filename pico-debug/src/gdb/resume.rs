//! The blocking `vCont` run loop.
//!
//! Continue-cores are resumed before any step is issued so that timers
//! and the inter-core hardware behave plausibly while one core advances.
//! The loop then watches both cores for a halt, the transport for a
//! disconnect and the inbound stream for the 0x03 interrupt byte.

use super::packet::ResumeAction;
use super::{stop_code, GdbServer, SIGINT};
use crate::adi::RunState;
use crate::io::GdbTransport;
use crate::swd::WireEngine;

impl<E: WireEngine, T: GdbTransport> GdbServer<E, T> {
    pub(super) fn handle_vcont(&mut self, actions: [ResumeAction; 2]) {
        let cur = self.target.current_core();
        let other = 1 - cur;

        // Resume the continue-cores first, then step.
        for core in [other, cur] {
            if actions[core] == ResumeAction::Continue {
                if let Err(e) = self.continue_core(core) {
                    tracing::warn!(core, "failed to resume: {e}");
                    super::reply::reply_error(&mut self.io, 1);
                    return;
                }
            }
        }
        for core in [other, cur] {
            if actions[core] == ResumeAction::Step {
                let stepped = self
                    .target
                    .select_core(core)
                    .and_then(|()| self.target.step_over_breakpoint());
                if let Err(e) = stepped {
                    tracing::warn!(core, "failed to step: {e}");
                    super::reply::reply_error(&mut self.io, 1);
                    return;
                }
            }
        }
        if self.target.select_core(cur).is_err() {
            super::reply::reply_error(&mut self.io, 1);
            return;
        }

        self.run_loop();
    }

    /// Resume one core, stepping over a breakpoint parked on the current
    /// PC first so the core doesn't re-halt without making progress.
    fn continue_core(&mut self, core: usize) -> crate::Result<()> {
        self.target.select_core(core)?;
        if self.target.core_status(core).0 == RunState::Halted {
            let pc = self.target.read_reg(crate::cortex::REG_PC)?;
            if self.target.is_breakpoint_set(pc) {
                self.target.step_over_breakpoint()?;
            }
        }
        self.target.resume()
    }

    fn run_loop(&mut self) {
        let mut pending_interrupt = false;

        loop {
            match self.target.poll_cores() {
                Ok(Some(halted)) => {
                    if pending_interrupt {
                        // The host asked for the stop; report it as a
                        // debug request on the selected core.
                        let tid = self.target.current_core() + 1;
                        self.send_stop_packet(tid, SIGINT);
                    } else {
                        let (_, reason) = self.target.core_status(halted);
                        self.send_stop_packet(halted + 1, stop_code(reason));
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("poll failed during run loop: {e}");
                    self.halt_all();
                    let tid = self.target.current_core() + 1;
                    self.send_stop_packet(tid, SIGINT);
                    return;
                }
            }

            if !self.io.is_connected() {
                tracing::info!("transport went away during run; halting cores");
                self.halt_all();
                return;
            }

            // A raw 0x03 from the host stops the world; the byte itself
            // stays queued and surfaces (harmlessly) as a framer event
            // later.
            if self.io.peek_byte() == Some(0x03) {
                tracing::debug!("interrupt request from host");
                self.halt_all();
                pending_interrupt = true;
                continue;
            }

            self.io.poll_wait();
        }
    }

    /// Best-effort halt of both cores, current core reselected.
    pub(super) fn halt_all(&mut self) {
        let cur = self.target.current_core();
        for core in [1 - cur, cur] {
            let halted = self
                .target
                .select_core(core)
                .and_then(|()| self.target.halt());
            if let Err(e) = halted {
                tracing::warn!(core, "failed to halt: {e}");
            }
        }
    }
}
