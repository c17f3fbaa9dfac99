//! The bring-up sequence of an e1000 NIC, as a chain of typed states.
//!
//! Each state only offers the step that may legally come next:
//! `Uninitialized -> MmioResolved -> AddressLoaded -> RingsConfigured -> E1000Nic` (enabled).
//! A failed step returns an error and drops everything acquired so far;
//! there is no retry and no way to skip a step.

use alloc::sync::Arc;
use core::{fmt, sync::atomic::AtomicBool};
use interrupt_controller::{SystemInterruptControllerApi, SystemInterruptNumber};
use intel_ethernet::descriptors::{LegacyRxDescriptor, LegacyTxDescriptor};
use memory_structs::{PhysicalAddress, VirtualAddress};
use nic_buffers::{BufferPool, DmaAllocator};
use nic_initialization::{init_rx_buf_pool, init_rx_queue, init_tx_queue};
use nic_queues::{RxQueue, TxQueue};
use pci::{PciBar, PciDevice};
use time::Delay;
use crate::{
    config::E1000Config,
    eeprom::EepromReader,
    error::E1000Error,
    interrupt::HANDLED_INTERRUPTS,
    mmio::{E1000Registers, E1000RxQueueRegisters, E1000TxQueueRegisters, MmioRegion, RegisterBackend},
    regs::*,
    E1000Nic, MacAddress, E1000_TX_BUFFER_SIZE_IN_BYTES,
};

/// Makes a device's physical register window accessible to the driver.
pub trait MapMmio {
    type Backend: RegisterBackend;

    /// Maps `size_in_bytes` of registers starting at `phys_base` as uncached device memory.
    fn map_mmio(&self, phys_base: PhysicalAddress, size_in_bytes: usize) -> Result<Self::Backend, &'static str>;
}

/// Reaches device registers through a kernel direct map,
/// in which all of physical memory is mapped at a fixed virtual offset.
pub struct DirectMapMmio {
    phys_offset: usize,
}

impl DirectMapMmio {
    /// # Safety
    /// Physical address `p` must be mapped, uncached, at virtual address `p + phys_offset`.
    pub const unsafe fn new(phys_offset: usize) -> DirectMapMmio {
        DirectMapMmio { phys_offset }
    }
}

impl MapMmio for DirectMapMmio {
    type Backend = MmioRegion;

    fn map_mmio(&self, phys_base: PhysicalAddress, size_in_bytes: usize) -> Result<MmioRegion, &'static str> {
        let vaddr = phys_base.value().checked_add(self.phys_offset)
            .and_then(VirtualAddress::new)
            .ok_or("MMIO region is outside the direct map")?;
        // SAFETY: guaranteed by the contract of `DirectMapMmio::new()`.
        Ok(unsafe { MmioRegion::new(vaddr, size_in_bytes) })
    }
}

/// Returns the first BAR that can hold the e1000's registers:
/// exactly 128 KiB, located above the low 64 KiB.
pub fn find_mmio_bar(pci_dev: &PciDevice) -> Option<(usize, PciBar)> {
    pci_dev.find_bar(|bar| bar.size == E1000_MMIO_SIZE as u64 && bar.base > E1000_MMIO_MIN_BASE)
}

/// Returns the physical base of the e1000's register window, or zero if no BAR matches.
pub fn resolve_mmio_base(pci_dev: &PciDevice) -> PhysicalAddress {
    find_mmio_bar(pci_dev)
        .and_then(|(_, bar)| bar.phys_base())
        .unwrap_or_else(PhysicalAddress::zero)
}

/// The steps of the bring-up sequence, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    MmioResolved,
    AddressLoaded,
    RingsConfigured,
    Enabled,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            InitState::Uninitialized => "uninitialized",
            InitState::MmioResolved => "MMIO resolved",
            InitState::AddressLoaded => "address loaded",
            InitState::RingsConfigured => "rings configured",
            InitState::Enabled => "enabled",
        };
        f.write_str(name)
    }
}

/// A state of the bring-up sequence.
pub trait InitializationState {
    const STATE: InitState;
}

pub struct Uninitialized;

pub struct MmioResolved<B: RegisterBackend> {
    mem_base: PhysicalAddress,
    regs: E1000Registers<B>,
}

pub struct AddressLoaded<B: RegisterBackend> {
    mem_base: PhysicalAddress,
    regs: E1000Registers<B>,
    mac_hardware: MacAddress,
}

pub struct RingsConfigured<B: RegisterBackend> {
    mem_base: PhysicalAddress,
    regs: E1000Registers<B>,
    mac_hardware: MacAddress,
    interrupt_num: SystemInterruptNumber,
    rx_queue: RxQueue<E1000RxQueueRegisters<B>, LegacyRxDescriptor>,
    tx_queue: TxQueue<E1000TxQueueRegisters<B>, LegacyTxDescriptor>,
    tx_buffer_pool: Arc<BufferPool>,
    allocator: Arc<dyn DmaAllocator>,
}

impl InitializationState for Uninitialized {
    const STATE: InitState = InitState::Uninitialized;
}
impl<B: RegisterBackend> InitializationState for MmioResolved<B> {
    const STATE: InitState = InitState::MmioResolved;
}
impl<B: RegisterBackend> InitializationState for AddressLoaded<B> {
    const STATE: InitState = InitState::AddressLoaded;
}
impl<B: RegisterBackend> InitializationState for RingsConfigured<B> {
    const STATE: InitState = InitState::RingsConfigured;
}

/// An e1000 NIC partway through initialization.
pub struct E1000Init<S: InitializationState> {
    pci_dev: PciDevice,
    config: E1000Config,
    state: S,
}

impl<S: InitializationState> E1000Init<S> {
    pub fn state(&self) -> InitState {
        S::STATE
    }

    /// Logs an error that ended initialization in this state.
    fn fail(&self, error: E1000Error) -> E1000Error {
        error!("e1000 {}: initialization failed ({}): {}", self.pci_dev.location, S::STATE, error);
        error
    }
}

impl E1000Init<Uninitialized> {
    pub fn new(pci_dev: PciDevice, config: E1000Config) -> Result<E1000Init<Uninitialized>, E1000Error> {
        let init = E1000Init { pci_dev, config, state: Uninitialized };
        config.validate().map_err(|e| init.fail(e))?;
        Ok(init)
    }

    /// Finds the register window among the device's BARs and maps it.
    pub fn resolve_mmio<M: MapMmio>(self, mapper: &M) -> Result<E1000Init<MmioResolved<M::Backend>>, E1000Error> {
        let (bar_index, bar) = find_mmio_bar(&self.pci_dev)
            .ok_or_else(|| self.fail(E1000Error::NoMatchingMmioRegion))?;
        let mem_base = bar.phys_base()
            .filter(|base| !base.is_zero())
            .ok_or_else(|| self.fail(E1000Error::NullMmioBase))?;
        info!("e1000 {}: MMIO base {:#X} (BAR{})", self.pci_dev.location, mem_base, bar_index);

        let backend = mapper.map_mmio(mem_base, E1000_MMIO_SIZE)
            .map_err(|e| self.fail(E1000Error::MmioMapFailed(e)))?;

        Ok(E1000Init {
            pci_dev: self.pci_dev,
            config: self.config,
            state: MmioResolved { mem_base, regs: E1000Registers::new(backend) },
        })
    }
}

impl<B: RegisterBackend> E1000Init<MmioResolved<B>> {
    /// Reads the station address from the EEPROM.
    pub fn load_address(self, delay: &dyn Delay) -> Result<E1000Init<AddressLoaded<B>>, E1000Error> {
        let mac_hardware = EepromReader::new(&self.state.regs, self.config.eeprom_poll, delay)
            .read_mac()
            .map_err(|e| self.fail(e))?;
        info!("e1000 {}: hardware MAC address: {:02x?}", self.pci_dev.location, mac_hardware);

        Ok(E1000Init {
            pci_dev: self.pci_dev,
            config: self.config,
            state: AddressLoaded {
                mem_base: self.state.mem_base,
                regs: self.state.regs,
                mac_hardware,
            },
        })
    }
}

impl<B: RegisterBackend> E1000Init<AddressLoaded<B>> {
    /// Routes the interrupt, brings the link up, sets up interrupts and creates both descriptor rings.
    /// The receiver stays disabled.
    pub fn configure_rings(
        self,
        interrupt_controller: &dyn SystemInterruptControllerApi,
        allocator: Arc<dyn DmaAllocator>,
        delay: Arc<dyn Delay>,
    ) -> Result<E1000Init<RingsConfigured<B>>, E1000Error> {
        let config = self.config;
        let regs = &self.state.regs;

        let interrupt_num = SystemInterruptNumber(self.pci_dev.int_line);
        interrupt_controller.enable_interrupt(interrupt_num, config.irq_target_cpu)
            .map_err(|e| self.fail(E1000Error::IrqRegistrationFailed(e)))?;
        debug!("e1000 {}: {} routed to {}", self.pci_dev.location, interrupt_num, config.irq_target_cpu);

        regs.set_ctrl_flags(Ctrl::SLU);
        regs.clear_multicast_table();
        regs.write_ims(HANDLED_INTERRUPTS);
        // reading ICR clears any causes that were already pending
        let stale = regs.read_icr();
        debug!("e1000: cleared stale interrupt causes {:?}", stale);

        // From here on the device may interrupt, so a failure masks it again.
        let (rx_queue, tx_queue, tx_buffer_pool) = create_queues(regs, &config, &allocator, delay)
            .map_err(|e| {
                regs.write_imc(InterruptCause::all());
                self.fail(e)
            })?;

        Ok(E1000Init {
            pci_dev: self.pci_dev,
            config,
            state: RingsConfigured {
                mem_base: self.state.mem_base,
                regs: self.state.regs,
                mac_hardware: self.state.mac_hardware,
                interrupt_num,
                rx_queue,
                tx_queue,
                tx_buffer_pool,
                allocator,
            },
        })
    }
}

/// Creates the receive buffer pool and both queues, publishing the rings to the device.
/// Leaves the receiver disabled.
#[allow(clippy::type_complexity)]
fn create_queues<B: RegisterBackend>(
    regs: &E1000Registers<B>,
    config: &E1000Config,
    allocator: &Arc<dyn DmaAllocator>,
    delay: Arc<dyn Delay>,
) -> Result<(
    RxQueue<E1000RxQueueRegisters<B>, LegacyRxDescriptor>,
    TxQueue<E1000TxQueueRegisters<B>, LegacyTxDescriptor>,
    Arc<BufferPool>,
), E1000Error> {
    // initialize the buffer pool, then the receive queue
    let rx_buffer_pool = Arc::new(BufferPool::new(config.rx_buffer_pool_size, usize::from(config.rx_buffer_size)));
    init_rx_buf_pool(config.rx_buffer_pool_size, &rx_buffer_pool, &**allocator)
        .map_err(E1000Error::DmaAllocationFailed)?;

    let mut rx_regs = regs.rx_queue_registers();
    let (rx_descs, rx_bufs_in_use) = init_rx_queue::<LegacyRxDescriptor, _>(
        usize::from(config.num_rx_descs), &rx_buffer_pool, &**allocator, &mut rx_regs,
    ).map_err(E1000Error::DmaAllocationFailed)?;
    info!("e1000: RX descriptor ring at {:#X}", rx_descs.phys_addr());
    regs.write_rctl(RCTL_CONFIG);

    let rx_queue = RxQueue::new(
        0,
        rx_regs,
        rx_descs,
        rx_bufs_in_use,
        config.rx_buffer_size,
        rx_buffer_pool,
        Arc::clone(allocator),
        config.max_pending_frames,
    ).map_err(E1000Error::InvalidConfig)?;

    let mut tx_regs = regs.tx_queue_registers();
    let tx_descs = init_tx_queue::<LegacyTxDescriptor, _>(usize::from(config.num_tx_descs), &**allocator, &mut tx_regs)
        .map_err(E1000Error::DmaAllocationFailed)?;
    info!("e1000: TX descriptor ring at {:#X}", tx_descs.phys_addr());
    regs.write_tctl(TCTL_CONFIG);

    let tx_queue = TxQueue::new(0, tx_regs, tx_descs, config.tx_completion_poll, delay)
        .map_err(E1000Error::InvalidConfig)?;
    let tx_buffer_pool = Arc::new(BufferPool::new(config.tx_buffer_pool_size, usize::from(E1000_TX_BUFFER_SIZE_IN_BYTES)));

    Ok((rx_queue, tx_queue, tx_buffer_pool))
}

impl<B: RegisterBackend> E1000Init<RingsConfigured<B>> {
    /// Turns on the receiver. From here on the device writes into the receive buffers.
    pub fn enable(self) -> E1000Nic<B> {
        let state = self.state;
        state.regs.enable_receiver();
        info!("e1000 {}: receiver enabled, RCTL: {:?}", self.pci_dev.location, state.regs.rctl());

        E1000Nic {
            location: self.pci_dev.location,
            mem_base: state.mem_base,
            interrupt_num: state.interrupt_num,
            mac_hardware: state.mac_hardware,
            mac_spoofed: None,
            rx_queue: state.rx_queue,
            tx_queue: state.tx_queue,
            tx_buffer_pool: state.tx_buffer_pool,
            allocator: state.allocator,
            regs: state.regs,
            rx_pending: Arc::new(AtomicBool::new(false)),
        }
    }
}
