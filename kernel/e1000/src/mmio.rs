//! Access to the e1000's memory-mapped registers.
//!
//! [`E1000Registers`] is the only way the driver touches the device:
//! it accepts named [`Register`]s and typed option sets,
//! and forwards each access to a [`RegisterBackend`] as a single 32-bit load or store.

use memory_structs::VirtualAddress;
use nic_queues::{RxQueueRegisters, TxQueueRegisters};
use volatile::Volatile;
use crate::regs::*;

/// Raw 32-bit register access at a byte offset into a device's register window.
///
/// Cloning a backend yields another handle to the same registers.
pub trait RegisterBackend: Clone + Send + Sync {
    /// Loads the register at `offset`. Never cached, never reordered with other accesses.
    fn read32(&self, offset: u32) -> u32;
    /// Stores `value` to the register at `offset`.
    fn write32(&self, offset: u32, value: u32);
}

/// A mapped region of MMIO registers, accessed with volatile loads and stores.
#[derive(Clone, Debug)]
pub struct MmioRegion {
    base: VirtualAddress,
    size_in_bytes: usize,
}

impl MmioRegion {
    /// Describes `size_in_bytes` of device registers mapped at `base`.
    ///
    /// # Safety
    /// `base` must be a valid, uncached mapping of the device's registers
    /// that stays mapped for as long as any clone of this region exists.
    pub unsafe fn new(base: VirtualAddress, size_in_bytes: usize) -> MmioRegion {
        MmioRegion { base, size_in_bytes }
    }

    pub fn start_address(&self) -> VirtualAddress {
        self.base
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    fn register(&self, offset: u32) -> *mut Volatile<u32> {
        debug_assert!(offset % 4 == 0, "unaligned register offset {:#X}", offset);
        debug_assert!(offset as usize + 4 <= self.size_in_bytes, "register offset {:#X} outside MMIO window", offset);
        (self.base + offset as usize).as_mut_ptr::<Volatile<u32>>()
    }
}

impl RegisterBackend for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        unsafe { (*self.register(offset)).read() }
    }

    fn write32(&self, offset: u32, value: u32) {
        unsafe { (*self.register(offset)).write(value) }
    }
}

/// The register window of one e1000 NIC.
#[derive(Clone)]
pub struct E1000Registers<B: RegisterBackend> {
    backend: B,
}

impl<B: RegisterBackend> E1000Registers<B> {
    pub fn new(backend: B) -> E1000Registers<B> {
        E1000Registers { backend }
    }

    #[inline]
    pub fn read(&self, reg: Register) -> u32 {
        self.backend.read32(reg.offset())
    }

    #[inline]
    pub fn write(&self, reg: Register, value: u32) {
        self.backend.write32(reg.offset(), value)
    }

    pub fn ctrl(&self) -> Ctrl {
        Ctrl::from_bits_truncate(self.read(Register::CTRL))
    }

    /// Sets `flags` in CTRL, leaving all other bits as they are.
    pub fn set_ctrl_flags(&self, flags: Ctrl) {
        let val = self.read(Register::CTRL);
        self.write(Register::CTRL, val | flags.bits());
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(self.read(Register::STATUS))
    }

    pub fn rctl(&self) -> Rctl {
        Rctl::from_bits_truncate(self.read(Register::RCTL))
    }

    /// Overwrites RCTL with exactly `flags`.
    pub fn write_rctl(&self, flags: Rctl) {
        self.write(Register::RCTL, flags.bits());
    }

    /// Sets the receiver enable bit, leaving the rest of RCTL as it is.
    pub fn enable_receiver(&self) {
        let val = self.read(Register::RCTL);
        self.write(Register::RCTL, val | Rctl::EN.bits());
    }

    pub fn tctl(&self) -> Tctl {
        Tctl::from_bits_truncate(self.read(Register::TCTL))
    }

    pub fn write_tctl(&self, flags: Tctl) {
        self.write(Register::TCTL, flags.bits());
    }

    /// Unmasks the interrupt sources in `causes`.
    pub fn write_ims(&self, causes: InterruptCause) {
        self.write(Register::IMS, causes.bits());
    }

    /// Masks the interrupt sources in `causes`.
    pub fn write_imc(&self, causes: InterruptCause) {
        self.write(Register::IMC, causes.bits());
    }

    /// Reads the pending interrupt causes. On real hardware this also clears them.
    pub fn read_icr(&self) -> InterruptCause {
        InterruptCause::from_bits_truncate(self.read(Register::ICR))
    }

    /// Acknowledges the interrupt causes in `causes` (write-one-to-clear).
    pub fn write_icr(&self, causes: InterruptCause) {
        self.write(Register::ICR, causes.bits());
    }

    /// Zeroes every entry of the Multicast Table Array.
    pub fn clear_multicast_table(&self) {
        for reg in (0..MTA_ENTRIES).filter_map(Register::mta) {
            self.write(reg, 0);
        }
    }

    /// Programs receive address 0 with `mac` and marks it valid.
    pub fn write_receive_address(&self, mac: [u8; 6]) {
        let low = u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]);
        let high = u32::from(u16::from_le_bytes([mac[4], mac[5]]));
        self.write(Register::RAL0, low);
        self.write(Register::RAH0, high | RAH_AV);
    }

    /// Returns a handle to the registers of the receive queue.
    pub fn rx_queue_registers(&self) -> E1000RxQueueRegisters<B> {
        E1000RxQueueRegisters(self.clone())
    }

    /// Returns a handle to the registers of the transmit queue.
    pub fn tx_queue_registers(&self) -> E1000TxQueueRegisters<B> {
        E1000TxQueueRegisters(self.clone())
    }
}

/// A struct which contains the receive queue registers and implements the `RxQueueRegisters` trait,
/// which is required to store the registers in an `RxQueue` object.
pub struct E1000RxQueueRegisters<B: RegisterBackend>(E1000Registers<B>);

impl<B: RegisterBackend> RxQueueRegisters for E1000RxQueueRegisters<B> {
    fn set_rdbal(&mut self, value: u32) {
        self.0.write(Register::RDBAL, value);
    }
    fn set_rdbah(&mut self, value: u32) {
        self.0.write(Register::RDBAH, value);
    }
    fn set_rdlen(&mut self, value: u32) {
        self.0.write(Register::RDLEN, value);
    }
    fn set_rdh(&mut self, value: u32) {
        self.0.write(Register::RDH, value);
    }
    fn set_rdt(&mut self, value: u32) {
        self.0.write(Register::RDT, value);
    }
}

/// A struct which contains the transmit queue registers and implements the `TxQueueRegisters` trait,
/// which is required to store the registers in a `TxQueue` object.
pub struct E1000TxQueueRegisters<B: RegisterBackend>(E1000Registers<B>);

impl<B: RegisterBackend> TxQueueRegisters for E1000TxQueueRegisters<B> {
    fn set_tdbal(&mut self, value: u32) {
        self.0.write(Register::TDBAL, value);
    }
    fn set_tdbah(&mut self, value: u32) {
        self.0.write(Register::TDBAH, value);
    }
    fn set_tdlen(&mut self, value: u32) {
        self.0.write(Register::TDLEN, value);
    }
    fn set_tdh(&mut self, value: u32) {
        self.0.write(Register::TDH, value);
    }
    fn set_tdt(&mut self, value: u32) {
        self.0.write(Register::TDT, value);
    }
}
