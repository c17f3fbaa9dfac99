//! Errors reported by the e1000 driver.

use derive_more::Display;
use nic_queues::NicQueueError;

/// The broad class an [`E1000Error`] falls into,
/// which tells the caller whether retrying or disabling the device makes sense.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device or the driver's configuration can't work; the device should be disabled.
    ConfigurationFault,
    /// The device didn't respond within the allowed number of polls.
    HardwareTimeout,
    /// A descriptor or descriptor index was not in the expected state.
    InvalidDescriptorState,
    /// A bounded resource (descriptors, buffers, DMA memory) ran out.
    ResourceExhausted,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum E1000Error {
    #[display(fmt = "no 128 KiB memory BAR above the 64 KiB boundary")]
    NoMatchingMmioRegion,
    #[display(fmt = "resolved MMIO base address is zero")]
    NullMmioBase,
    #[display(fmt = "couldn't map MMIO registers: {}", _0)]
    MmioMapFailed(&'static str),
    #[display(fmt = "EEPROM read of word {} timed out", address)]
    EepromTimeout { address: u8 },
    #[display(fmt = "couldn't register interrupt: {}", _0)]
    IrqRegistrationFailed(&'static str),
    #[display(fmt = "couldn't allocate DMA memory: {}", _0)]
    DmaAllocationFailed(&'static str),
    #[display(fmt = "{}", _0)]
    Queue(NicQueueError),
    #[display(fmt = "an e1000 NIC is already installed")]
    AlreadyInstalled,
    #[display(fmt = "invalid driver configuration: {}", _0)]
    InvalidConfig(&'static str),
}

impl E1000Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            E1000Error::NoMatchingMmioRegion
            | E1000Error::NullMmioBase
            | E1000Error::MmioMapFailed(_)
            | E1000Error::IrqRegistrationFailed(_)
            | E1000Error::AlreadyInstalled
            | E1000Error::InvalidConfig(_) => ErrorKind::ConfigurationFault,
            E1000Error::EepromTimeout { .. } => ErrorKind::HardwareTimeout,
            E1000Error::DmaAllocationFailed(_) => ErrorKind::ResourceExhausted,
            E1000Error::Queue(e) => match e {
                NicQueueError::QueueFull
                | NicQueueError::ReceiveBufferUnavailable { .. } => ErrorKind::ResourceExhausted,
                NicQueueError::TxCompletionTimeout { .. } => ErrorKind::HardwareTimeout,
                NicQueueError::InvalidIndex(_)
                | NicQueueError::PacketTooLarge(_)
                | NicQueueError::EmptyPacket => ErrorKind::InvalidDescriptorState,
            },
        }
    }
}

impl From<NicQueueError> for E1000Error {
    fn from(e: NicQueueError) -> E1000Error {
        E1000Error::Queue(e)
    }
}
