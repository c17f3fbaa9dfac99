//! Driver for the Intel 82540EM ("e1000") Ethernet controller,
//! the NIC emulated by QEMU, Bochs and VirtualBox.
//!
//! A NIC is brought up with [`E1000Nic::init()`], which walks through the states in [`init`],
//! and can then be handed to the [`registry`] so that the interrupt entry point can reach it.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;
extern crate alloc;

pub mod config;
pub mod eeprom;
pub mod error;
pub mod init;
pub mod interrupt;
pub mod mmio;
pub mod registry;
pub mod regs;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use interrupt_controller::{SystemInterruptControllerApi, SystemInterruptNumber};
use intel_ethernet::descriptors::{LegacyRxDescriptor, LegacyTxDescriptor};
use memory_structs::PhysicalAddress;
use nic_buffers::{BufferPool, DmaAllocator, ReceivedFrame, TransmitBuffer};
use nic_queues::{NicQueueError, RxQueue, TxQueue};
use pci::{PciDevice, PciLocation};
use time::Delay;

pub use config::E1000Config;
pub use error::{E1000Error, ErrorKind};
pub use init::{resolve_mmio_base, DirectMapMmio, E1000Init, InitState, MapMmio};
pub use interrupt::E1000InterruptHandler;
pub use mmio::{E1000Registers, MmioRegion, RegisterBackend};
pub use regs::{E1000_DEV, INTEL_VEND};

use mmio::{E1000RxQueueRegisters, E1000TxQueueRegisters};
use interrupt::HANDLED_INTERRUPTS;
use regs::{InterruptCause, Status};

/// An Ethernet station address.
pub type MacAddress = [u8; 6];

/// Each transmit buffer holds one standard Ethernet frame.
pub const E1000_TX_BUFFER_SIZE_IN_BYTES: u16 = 2048;

/// Struct representing an e1000 network interface card.
pub struct E1000Nic<B: RegisterBackend> {
    location: PciLocation,
    /// MMIO Base Address
    mem_base: PhysicalAddress,
    interrupt_num: SystemInterruptNumber,
    /// The actual MAC address burnt into the hardware of this E1000 NIC.
    mac_hardware: MacAddress,
    /// The optional spoofed MAC address to use in place of `mac_hardware`.
    mac_spoofed: Option<MacAddress>,
    /// Receive queue with descriptors
    rx_queue: RxQueue<E1000RxQueueRegisters<B>, LegacyRxDescriptor>,
    /// Transmit queue with descriptors
    tx_queue: TxQueue<E1000TxQueueRegisters<B>, LegacyTxDescriptor>,
    tx_buffer_pool: Arc<BufferPool>,
    allocator: Arc<dyn DmaAllocator>,
    /// memory-mapped control registers
    regs: E1000Registers<B>,
    /// Set by the interrupt handler, cleared by `poll_receive()`.
    rx_pending: Arc<AtomicBool>,
}

impl<B: RegisterBackend> E1000Nic<B> {
    /// Initializes the e1000 NIC that is connected as the given `PciDevice`,
    /// leaving it with both rings set up and the receiver enabled.
    ///
    /// Nothing is installed globally; see [`registry::install()`] for that.
    pub fn init<M: MapMmio<Backend = B>>(
        e1000_pci_dev: &PciDevice,
        config: E1000Config,
        mapper: &M,
        allocator: Arc<dyn DmaAllocator>,
        interrupt_controller: &dyn SystemInterruptControllerApi,
        delay: Arc<dyn Delay>,
    ) -> Result<E1000Nic<B>, E1000Error> {
        let nic = E1000Init::new(e1000_pci_dev.clone(), config)?
            .resolve_mmio(mapper)?
            .load_address(&*delay)?
            .configure_rings(interrupt_controller, allocator, delay)?
            .enable();
        Ok(nic)
    }

    pub fn location(&self) -> PciLocation {
        self.location
    }

    /// The physical address of the register window.
    pub fn mem_base(&self) -> PhysicalAddress {
        self.mem_base
    }

    pub fn interrupt_number(&self) -> SystemInterruptNumber {
        self.interrupt_num
    }

    /// Returns the spoofed MAC address if one was set, or else the hardware one.
    pub fn mac_address(&self) -> MacAddress {
        self.mac_spoofed.unwrap_or(self.mac_hardware)
    }

    /// Makes the NIC use `spoofed_mac_addr` in place of its hardware address,
    /// including as the destination address it accepts frames for.
    pub fn spoof_mac(&mut self, spoofed_mac_addr: MacAddress) {
        self.mac_spoofed = Some(spoofed_mac_addr);
        self.regs.write_receive_address(spoofed_mac_addr);
        debug!("e1000 {}: spoofed MAC address: {:02x?}", self.location, spoofed_mac_addr);
    }

    pub fn link_up(&self) -> bool {
        self.regs.status().contains(Status::LU)
    }

    /// Hands `transmit_buffer` to the device.
    /// Returns the index of the transmit descriptor used, for [`Self::wait_for_tx_completion()`].
    ///
    /// A buffer the device couldn't take is handed back with the error, e.g., to retry after a `QueueFull`.
    pub fn send_packet(&mut self, transmit_buffer: TransmitBuffer) -> Result<u16, (E1000Error, TransmitBuffer)> {
        self.tx_queue.send_on_queue(transmit_buffer)
            .map_err(|(e, buffer)| (E1000Error::from(e), buffer))
    }

    /// Copies `packet` into a pooled transmit buffer and sends it.
    pub fn transmit(&mut self, packet: &[u8]) -> Result<u16, E1000Error> {
        let length = u16::try_from(packet.len()).ok()
            .filter(|&len| len <= E1000_TX_BUFFER_SIZE_IN_BYTES)
            .ok_or(NicQueueError::PacketTooLarge(packet.len()))?;
        let mut transmit_buffer = TransmitBuffer::from_pool(&self.tx_buffer_pool, &*self.allocator, length)
            .map_err(E1000Error::DmaAllocationFailed)?;
        transmit_buffer.copy_from_slice(packet);
        // a rejected buffer goes back to the pool, the caller still has `packet`
        self.send_packet(transmit_buffer).map_err(|(e, _buffer)| e)
    }

    /// Waits, with a bounded poll, until the device has sent the packet in transmit descriptor `index`.
    pub fn wait_for_tx_completion(&self, index: u16) -> Result<(), E1000Error> {
        Ok(self.tx_queue.wait_for_tx_completion(index)?)
    }

    /// Moves completed descriptors from the receive ring into the queue of received frames.
    /// Also clears the receive-pending flag set by the interrupt handler.
    ///
    /// Returns the number of frames that were completed.
    pub fn poll_receive(&mut self) -> Result<usize, E1000Error> {
        self.rx_pending.store(false, Ordering::Release);
        Ok(self.rx_queue.poll_queue_and_store_received_packets()?)
    }

    /// Takes the oldest received frame. Its buffers return to the receive pool once it's dropped.
    pub fn get_received_frame(&mut self) -> Option<ReceivedFrame> {
        self.rx_queue.return_frame()
    }

    /// Returns `true` if a receive interrupt arrived since the last [`Self::poll_receive()`].
    pub fn rx_pending(&self) -> bool {
        self.rx_pending.load(Ordering::Acquire)
    }

    /// The number of received descriptors that were dropped as invalid.
    pub fn invalid_rx_descriptors(&self) -> u64 {
        self.rx_queue.invalid_descriptors
    }

    /// Returns a handler that acknowledges this NIC's interrupts without needing access to the NIC itself.
    pub fn interrupt_handler(&self) -> E1000InterruptHandler<B> {
        E1000InterruptHandler::new(self.regs.clone(), Arc::clone(&self.rx_pending))
    }

    /// Masks every interrupt source and clears whatever is pending.
    pub fn disable_interrupts(&self) {
        self.mask_interrupts();
        let _ = self.regs.read_icr();
    }

    /// Masks every interrupt source. Pending causes stay latched in ICR.
    fn mask_interrupts(&self) {
        self.regs.write_imc(InterruptCause::all());
    }

    /// Unmasks the interrupt sources the driver handles.
    fn unmask_interrupts(&self) {
        self.regs.write_ims(HANDLED_INTERRUPTS);
    }
}
