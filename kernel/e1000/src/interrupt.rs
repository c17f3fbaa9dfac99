//! Acknowledging the e1000's interrupts.
//!
//! The handler is kept separate from the [`E1000Nic`](crate::E1000Nic) so that it can run
//! without taking the lock that protects the NIC's queues.
//! It never looks at descriptors; it only records that received packets are waiting.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use crate::{
    mmio::{E1000Registers, RegisterBackend},
    regs::InterruptCause,
};

/// The interrupt sources the driver unmasks and acknowledges.
pub const HANDLED_INTERRUPTS: InterruptCause = InterruptCause::RXT0;

#[derive(Clone)]
pub struct E1000InterruptHandler<B: RegisterBackend> {
    regs: E1000Registers<B>,
    rx_pending: Arc<AtomicBool>,
}

impl<B: RegisterBackend> E1000InterruptHandler<B> {
    pub(crate) fn new(regs: E1000Registers<B>, rx_pending: Arc<AtomicBool>) -> E1000InterruptHandler<B> {
        E1000InterruptHandler { regs, rx_pending }
    }

    /// The main interrupt handling routine for the e1000 NIC.
    /// This should be invoked from the actual interrupt handler entry point.
    ///
    /// On a receive timer interrupt, writes the RXT0 bit back to ICR and
    /// flags that received packets are waiting. No other register is written.
    ///
    /// Returns the causes that were pending.
    pub fn handle_interrupt(&self) -> InterruptCause {
        let causes = self.regs.read_icr();

        if causes.contains(InterruptCause::RXT0) {
            self.regs.write_icr(InterruptCause::RXT0);
            self.rx_pending.store(true, Ordering::Release);
        }

        let unexpected = causes - HANDLED_INTERRUPTS;
        if !unexpected.is_empty() {
            warn!("e1000::handle_interrupt(): unhandled interrupt causes: {:?}", unexpected);
        }
        causes
    }

    /// Returns `true` if a receive interrupt arrived since the flag was last cleared.
    pub fn rx_pending(&self) -> bool {
        self.rx_pending.load(Ordering::Acquire)
    }
}
