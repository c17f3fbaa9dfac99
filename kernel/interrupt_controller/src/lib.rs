//! The interface that device drivers use to route their interrupt to a CPU.
//!
//! The actual controller (an IoApic on x86_64, the GIC distributor on aarch64)
//! lives elsewhere in the kernel and implements [`SystemInterruptControllerApi`].

#![cfg_attr(not(test), no_std)]

use derive_more::{Display, From, Into};

/// A unique identifier for a CPU core.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[display(fmt = "cpu{}", _0)]
pub struct CpuId(pub u32);

/// The interrupt line number a device raises, as seen by the system-wide controller.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, From, Into)]
#[display(fmt = "irq{}", _0)]
pub struct SystemInterruptNumber(pub u8);

/// A top-level/system-wide interrupt controller chip,
/// responsible for routing interrupts from peripherals to CPU cores.
pub trait SystemInterruptControllerApi: Send + Sync {
    /// Routes `sys_int_num` to `destination` and unmasks it at the controller.
    fn enable_interrupt(
        &self,
        sys_int_num: SystemInterruptNumber,
        destination: CpuId,
    ) -> Result<(), &'static str>;
}
