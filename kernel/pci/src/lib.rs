//! Description of a PCI function, as produced by the PCI bus scan.
//!
//! Bus enumeration and config-space access happen elsewhere;
//! drivers only see the decoded Base Address Registers and the interrupt line.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use bit_field::BitField;
use memory_structs::PhysicalAddress;

/// Each PCI function has at most six Base Address Registers.
pub const PCI_NUM_BARS: usize = 6;

/// Bit 0 of a raw BAR value: set for I/O-space BARs, clear for memory-space BARs.
const BAR_IO_SPACE: u32 = 1 << 0;

/// The bus, slot, and function number of a given PCI device.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct PciLocation {
    bus:  u8,
    slot: u8,
    func: u8,
}

impl PciLocation {
    pub const fn new(bus: u8, slot: u8, func: u8) -> PciLocation {
        PciLocation { bus, slot, func }
    }
    pub fn bus(&self) -> u8 { self.bus }
    pub fn slot(&self) -> u8 { self.slot }
    pub fn function(&self) -> u8 { self.func }
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "b{}.s{}.f{}", self.bus, self.slot, self.func)
    }
}

impl fmt::Debug for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// One decoded Base Address Register: where a region starts and how big it is.
///
/// An unused BAR has a base and size of zero.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct PciBar {
    /// The starting physical address of the region, with the BAR's info bits cleared.
    pub base: u64,
    /// The size of the region in bytes.
    pub size: u64,
}

impl PciBar {
    pub const fn new(base: u64, size: u64) -> PciBar {
        PciBar { base, size }
    }

    /// Decodes a raw 32-bit memory BAR value and its probed size.
    ///
    /// I/O-space BARs can't be memory-mapped, so they decode to an unused BAR.
    pub fn from_raw(raw_bar: u32, size: u64) -> PciBar {
        if raw_bar & BAR_IO_SPACE != 0 {
            return PciBar::default();
        }
        let mut base = raw_bar;
        // the bottom 4 bits are type/prefetch info, the region is 16-byte aligned
        base.set_bits(0..4, 0);
        PciBar { base: base as u64, size }
    }

    /// Returns `true` if this BAR doesn't describe any region.
    pub fn is_unused(&self) -> bool {
        self.base == 0 && self.size == 0
    }

    /// Returns the base of this region as a `PhysicalAddress`,
    /// or `None` if it isn't a canonical physical address.
    pub fn phys_base(&self) -> Option<PhysicalAddress> {
        PhysicalAddress::new(self.base as usize)
    }
}

/// A PCI function as seen by a device driver.
#[derive(Clone, Debug, Default)]
pub struct PciDevice {
    /// the bus, slot, and function number that locates this PCI device in the bus tree.
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    /// The six Base Address Registers (BARs), already decoded into regions.
    pub bars: [PciBar; PCI_NUM_BARS],
    /// The legacy interrupt line routed to this function.
    pub int_line: u8,
}

impl PciDevice {
    /// Returns the BAR at `bar_index`, which must be between `0` and `5` inclusively.
    pub fn bar(&self, bar_index: usize) -> Option<&PciBar> {
        self.bars.get(bar_index)
    }

    /// Returns the index and contents of the first BAR that satisfies `predicate`.
    pub fn find_bar<P>(&self, mut predicate: P) -> Option<(usize, PciBar)>
    where
        P: FnMut(&PciBar) -> bool,
    {
        self.bars.iter()
            .enumerate()
            .find(|(_, bar)| predicate(bar))
            .map(|(i, bar)| (i, *bar))
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{:04x}:{:04x}] irq {}", self.location, self.vendor_id, self.device_id, self.int_line)
    }
}
