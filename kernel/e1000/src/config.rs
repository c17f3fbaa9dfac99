//! Tunables of the e1000 driver.

use interrupt_controller::CpuId;
use time::PollPolicy;
use crate::{error::E1000Error, regs::E1000_RX_BUFFER_SIZE_IN_BYTES};

/// Settings used when bringing up an e1000 NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E1000Config {
    /// Number of receive descriptors. Must be a non-zero multiple of 8.
    pub num_rx_descs: u16,
    /// Number of transmit descriptors. Must be a non-zero multiple of 8.
    pub num_tx_descs: u16,
    /// Size of every receive buffer; must match the size programmed into RCTL.
    pub rx_buffer_size: u16,
    /// The most receive buffers that ever exist, counting those attached to the ring
    /// and those held by received frames. All of them are allocated up front.
    pub rx_buffer_pool_size: usize,
    /// The most transmit buffers that ever exist.
    pub tx_buffer_pool_size: usize,
    /// Received frames held for the consumer before the receive queue stops draining the ring.
    pub max_pending_frames: usize,
    /// How long to wait for an EEPROM read to finish.
    pub eeprom_poll: PollPolicy,
    /// How long to wait for the device to finish sending a packet.
    pub tx_completion_poll: PollPolicy,
    /// The CPU the NIC's interrupt is routed to.
    pub irq_target_cpu: CpuId,
}

impl E1000Config {
    /// The default configuration, with interrupts routed to `irq_target_cpu`.
    pub fn new(irq_target_cpu: CpuId) -> E1000Config {
        E1000Config {
            num_rx_descs: 16,
            num_tx_descs: 16,
            rx_buffer_size: E1000_RX_BUFFER_SIZE_IN_BYTES,
            rx_buffer_pool_size: 64,
            tx_buffer_pool_size: 16,
            max_pending_frames: 48,
            eeprom_poll: PollPolicy::default(),
            tx_completion_poll: PollPolicy::default(),
            irq_target_cpu,
        }
    }

    /// Checks the constraints the hardware places on these settings.
    pub fn validate(&self) -> Result<(), E1000Error> {
        // RDLEN and TDLEN must be multiples of 128 bytes, i.e., 8 descriptors
        if self.num_rx_descs == 0 || self.num_rx_descs % 8 != 0 {
            return Err(E1000Error::InvalidConfig("number of receive descriptors must be a non-zero multiple of 8"));
        }
        if self.num_tx_descs == 0 || self.num_tx_descs % 8 != 0 {
            return Err(E1000Error::InvalidConfig("number of transmit descriptors must be a non-zero multiple of 8"));
        }
        if self.rx_buffer_size != E1000_RX_BUFFER_SIZE_IN_BYTES {
            return Err(E1000Error::InvalidConfig("receive buffer size must be 2048 bytes"));
        }
        if self.max_pending_frames == 0 {
            return Err(E1000Error::InvalidConfig("at least one received frame must be able to wait for the consumer"));
        }
        if self.rx_buffer_pool_size < usize::from(self.num_rx_descs) + self.max_pending_frames {
            return Err(E1000Error::InvalidConfig("receive buffer pool must cover the ring plus every pending frame"));
        }
        if self.tx_buffer_pool_size < usize::from(self.num_tx_descs) {
            return Err(E1000Error::InvalidConfig("transmit buffer pool must cover the transmit ring"));
        }
        Ok(())
    }
}

impl Default for E1000Config {
    fn default() -> E1000Config {
        E1000Config::new(CpuId(0))
    }
}
