//! Legacy descriptors, as walked by the DMA engine of 8254x-class controllers.
//!
//! Software fills in buffer addresses and commands;
//! the device writes back lengths, status and error bits.

use core::fmt;
use memory_structs::PhysicalAddress;
use volatile::{ReadOnly, Volatile};

/// A trait for functionalities that all receive descriptors must support.
pub trait RxDescriptor {
    /// Initializes a receive descriptor by clearing its status
    /// and setting the descriptor's physical address.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Updates the descriptor's physical address.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Clears the status bits of the descriptor.
    fn reset_status(&mut self);

    /// The buffer address currently programmed into this descriptor.
    fn packet_address(&self) -> u64;

    /// Returns true if the descriptor has a received packet copied to its buffer.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The length of the packet in the descriptor's packet buffer.
    fn length(&self) -> u64;

    /// Receive errors the device reported for this descriptor.
    fn errors(&self) -> RxErrors;
}

/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor {
    /// Initializes a transmit descriptor by clearing all of its values.
    fn init(&mut self);

    /// Updates the transmit descriptor to send the packet.
    /// We assume that one transmit descriptor will be used to send one packet.
    ///
    /// # Arguments
    /// * `transmit_buffer_addr`: physical address of the transmit buffer.
    /// * `transmit_buffer_length`: length of packet we want to send.
    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16);

    /// Returns true once the device has finished with this descriptor.
    fn descriptor_done(&self) -> bool;

    /// The buffer address currently programmed into this descriptor.
    fn packet_address(&self) -> u64;

    /// The command bits currently programmed into this descriptor.
    fn command(&self) -> TxCommand;
}

bitflags! {
    /// Status bits written back by the device into a receive descriptor.
    pub struct RxStatus: u8 {
        /// Descriptor Done
        const DD    = 1 << 0;
        /// End of Packet
        const EOP   = 1 << 1;
        /// Ignore Checksum Indication
        const IXSM  = 1 << 2;
        /// Packet is 802.1Q
        const VP    = 1 << 3;
        const TCPCS = 1 << 5;
        const IPCS  = 1 << 6;
        /// Passed in-exact filter
        const PIF   = 1 << 7;
    }
}

bitflags! {
    /// Error bits written back by the device into a receive descriptor.
    pub struct RxErrors: u8 {
        /// CRC Error or Alignment Error
        const CE   = 1 << 0;
        /// Symbol Error
        const SE   = 1 << 1;
        /// Sequence Error
        const SEQ  = 1 << 2;
        /// Carrier Extension Error
        const CXE  = 1 << 4;
        const TCPE = 1 << 5;
        const IPE  = 1 << 6;
        /// RX Data Error
        const RXE  = 1 << 7;
    }
}

bitflags! {
    /// Command bits of a legacy transmit descriptor.
    pub struct TxCommand: u8 {
        /// End of Packet
        const EOP  = 1 << 0;
        /// Insert FCS
        const IFCS = 1 << 1;
        /// Insert Checksum
        const IC   = 1 << 2;
        /// Report Status
        const RS   = 1 << 3;
        /// Report Packet Sent
        const RPS  = 1 << 4;
        /// VLAN Packet Enable
        const VLE  = 1 << 6;
        /// Interrupt Delay Enable
        const IDE  = 1 << 7;
    }
}

bitflags! {
    /// Status bits written back by the device into a transmit descriptor.
    pub struct TxStatus: u8 {
        /// Descriptor Done
        const DD = 1 << 0;
        /// Excess Collisions
        const EC = 1 << 1;
        /// Late Collision
        const LC = 1 << 2;
    }
}

/// The command used for every packet we send: one buffer per frame,
/// hardware-appended CRC, and a status write-back when done.
pub const TX_CMD_SEND: TxCommand = TxCommand::from_bits_truncate(
    TxCommand::EOP.bits() | TxCommand::IFCS.bits() | TxCommand::RS.bits()
);

/// This struct is a Legacy Receive Descriptor.
/// There is one instance of this struct per receive buffer.
#[repr(C)]
pub struct LegacyRxDescriptor {
    /// The starting physical address of the receive buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the received data in bytes
    pub length:     ReadOnly<u16>,
    /// Packet checksum
    pub checksum:   ReadOnly<u16>,
    /// Status bits which tell if the descriptor has been used
    pub status:     Volatile<u8>,
    /// Receive errors
    pub errors:     ReadOnly<u8>,
    pub special:    ReadOnly<u16>,
}

assert_eq_size!(LegacyRxDescriptor, [u8; 16]);

impl RxDescriptor for LegacyRxDescriptor {
    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.as_u64());
        self.status.write(0);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.as_u64());
    }

    fn reset_status(&mut self) {
        self.status.write(0);
    }

    fn packet_address(&self) -> u64 {
        self.phys_addr.read()
    }

    fn descriptor_done(&self) -> bool {
        RxStatus::from_bits_truncate(self.status.read()).contains(RxStatus::DD)
    }

    fn end_of_packet(&self) -> bool {
        RxStatus::from_bits_truncate(self.status.read()).contains(RxStatus::EOP)
    }

    fn length(&self) -> u64 {
        u64::from(self.length.read())
    }

    fn errors(&self) -> RxErrors {
        RxErrors::from_bits_truncate(self.errors.read())
    }
}

impl fmt::Debug for LegacyRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, checksum: {}, status: {:#X}, errors: {:#X}, special: {}}}",
            self.phys_addr.read(), self.length.read(), self.checksum.read(),
            self.status.read(), self.errors.read(), self.special.read())
    }
}

/// This struct is a Legacy Transmit Descriptor.
/// There is one instance of this struct per transmit buffer.
#[repr(C)]
pub struct LegacyTxDescriptor {
    /// The starting physical address of the transmit buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the transmit buffer in bytes
    pub length:     Volatile<u16>,
    /// Checksum offset
    pub cso:        Volatile<u8>,
    /// Command bits
    pub cmd:        Volatile<u8>,
    /// Status bits
    pub status:     Volatile<u8>,
    /// Checksum start
    pub css:        Volatile<u8>,
    pub special:    Volatile<u16>,
}

assert_eq_size!(LegacyTxDescriptor, [u8; 16]);

impl TxDescriptor for LegacyTxDescriptor {
    fn init(&mut self) {
        self.phys_addr.write(0);
        self.length.write(0);
        self.cso.write(0);
        self.cmd.write(0);
        self.status.write(0);
        self.css.write(0);
        self.special.write(0);
    }

    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16) {
        self.phys_addr.write(transmit_buffer_addr.as_u64());
        self.length.write(transmit_buffer_length);
        self.cmd.write(TX_CMD_SEND.bits());
        self.status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        TxStatus::from_bits_truncate(self.status.read()).contains(TxStatus::DD)
    }

    fn packet_address(&self) -> u64 {
        self.phys_addr.read()
    }

    fn command(&self) -> TxCommand {
        TxCommand::from_bits_truncate(self.cmd.read())
    }
}

impl fmt::Debug for LegacyTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, cso: {}, cmd: {:#X}, status: {:#X}, css: {}, special: {}}}",
            self.phys_addr.read(), self.length.read(), self.cso.read(), self.cmd.read(),
            self.status.read(), self.css.read(), self.special.read())
    }
}
