//! Ownership of the installed e1000 NIC.
//!
//! The device and its interrupt handler are stored separately:
//! the handler can always be reached from interrupt context without
//! waiting on whoever currently holds the device.

use spin::{Mutex, RwLock};
#[cfg(test)]
use spin::RwLockWriteGuard;
use crate::{
    error::E1000Error,
    interrupt::E1000InterruptHandler,
    mmio::{MmioRegion, RegisterBackend},
    regs::InterruptCause,
    E1000Nic,
};

/// Holds at most one e1000 NIC, from `install()` until `remove()`.
pub struct DeviceRegistry<B: RegisterBackend> {
    nic: Mutex<Option<E1000Nic<B>>>,
    interrupt_handler: RwLock<Option<E1000InterruptHandler<B>>>,
}

impl<B: RegisterBackend> DeviceRegistry<B> {
    pub const fn new() -> DeviceRegistry<B> {
        DeviceRegistry {
            nic: Mutex::new(None),
            interrupt_handler: RwLock::new(None),
        }
    }

    /// Takes ownership of `nic` and makes its interrupts handled.
    ///
    /// Fails with [`E1000Error::AlreadyInstalled`] if a NIC is already installed,
    /// in which case `nic` is dropped.
    pub fn install(&self, nic: E1000Nic<B>) -> Result<(), E1000Error> {
        let mut slot = self.nic.lock();
        if slot.is_some() {
            error!("e1000: can't install NIC at {}, another one is already installed", nic.location());
            return Err(E1000Error::AlreadyInstalled);
        }
        // The device stays quiet while the handler slot is locked for writing;
        // anything it latches meanwhile is raised again once unmasked.
        nic.mask_interrupts();
        *self.interrupt_handler.write() = Some(nic.interrupt_handler());
        nic.unmask_interrupts();
        info!("e1000: installed NIC at {} with MAC address {:02x?}", nic.location(), nic.mac_address());
        *slot = Some(nic);
        Ok(())
    }

    /// Runs `f` on the installed NIC, or returns `None` if there is none.
    pub fn with_nic<R, F: FnOnce(&mut E1000Nic<B>) -> R>(&self, f: F) -> Option<R> {
        self.nic.lock().as_mut().map(f)
    }

    /// Uninstalls the NIC and returns it with all of its interrupts masked.
    pub fn remove(&self) -> Option<E1000Nic<B>> {
        let nic = self.nic.lock().take()?;
        nic.disable_interrupts();
        *self.interrupt_handler.write() = None;
        info!("e1000: removed NIC at {}", nic.location());
        Some(nic)
    }

    pub fn is_installed(&self) -> bool {
        self.nic.lock().is_some()
    }

    /// Acknowledges the installed NIC's pending interrupt.
    pub fn handle_interrupt(&self) -> InterruptOutcome {
        match self.interrupt_handler.try_read() {
            Some(handler) => match handler.as_ref() {
                Some(handler) => InterruptOutcome::Handled(handler.handle_interrupt()),
                None => InterruptOutcome::NotInstalled,
            },
            None => InterruptOutcome::Busy,
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_handler_slot(&self) -> RwLockWriteGuard<'_, Option<E1000InterruptHandler<B>>> {
        self.interrupt_handler.write()
    }
}

/// What happened to an interrupt passed to [`DeviceRegistry::handle_interrupt()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The installed NIC's handler ran; these were the pending causes.
    Handled(InterruptCause),
    /// No NIC is installed.
    NotInstalled,
    /// A NIC is being installed or removed right now.
    /// Its interrupts are masked meanwhile, so the causes stay latched until it's done.
    Busy,
}

impl<B: RegisterBackend> Default for DeviceRegistry<B> {
    fn default() -> DeviceRegistry<B> {
        DeviceRegistry::new()
    }
}

/// The single instance of the E1000 NIC.
static E1000_NIC: DeviceRegistry<MmioRegion> = DeviceRegistry::new();

/// Installs `nic` as the system's e1000 NIC.
pub fn install(nic: E1000Nic<MmioRegion>) -> Result<(), E1000Error> {
    E1000_NIC.install(nic)
}

/// Runs `f` on the system's e1000 NIC, if one is installed.
pub fn with_e1000_nic<R, F: FnOnce(&mut E1000Nic<MmioRegion>) -> R>(f: F) -> Option<R> {
    E1000_NIC.with_nic(f)
}

/// Uninstalls and returns the system's e1000 NIC.
pub fn remove() -> Option<E1000Nic<MmioRegion>> {
    E1000_NIC.remove()
}

/// The entry point for the e1000's interrupt line, called by the kernel's interrupt dispatcher,
/// which is also responsible for signaling the end of the interrupt.
///
/// Returns `true` if the interrupt was handled.
pub fn e1000_interrupt_handler() -> bool {
    match E1000_NIC.handle_interrupt() {
        InterruptOutcome::Handled(_causes) => true,
        InterruptOutcome::Busy => {
            debug!("e1000_interrupt_handler(): NIC is being installed or removed, causes left pending");
            false
        }
        InterruptOutcome::NotInstalled => {
            error!("BUG: e1000_interrupt_handler(): E1000 NIC hasn't yet been initialized!");
            false
        }
    }
}
