//! Register offsets of the 82540EM and the values written into them.
//!
//! Registers can only be named through the associated constants of [`Register`],
//! so no code outside this module can build an arbitrary offset into the MMIO window.

/// Size in bytes of the memory-mapped register window (BAR0).
pub const E1000_MMIO_SIZE: usize = 0x20000;

/// MMIO BARs below this address can't belong to the e1000.
pub const E1000_MMIO_MIN_BASE: u64 = 0xFFFF;

/// Number of 32-bit entries in the Multicast Table Array.
pub const MTA_ENTRIES: usize = 128;

pub const INTEL_VEND: u16 = 0x8086;
/// Device ID for the e1000 emulated by QEMU, Bochs and VirtualBox.
pub const E1000_DEV: u16 = 0x100E;

/// One named 32-bit register within the e1000's MMIO window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(u32);

impl Register {
    pub const CTRL:     Register = Register(0x0000);
    pub const STATUS:   Register = Register(0x0008);
    /// EEPROM Read
    pub const EERD:     Register = Register(0x0014);
    /// Interrupt Cause Read
    pub const ICR:      Register = Register(0x00C0);
    /// Interrupt Mask Set/Read
    pub const IMS:      Register = Register(0x00D0);
    /// Interrupt Mask Clear
    pub const IMC:      Register = Register(0x00D8);
    pub const RCTL:     Register = Register(0x0100);
    pub const TCTL:     Register = Register(0x0400);

    pub const RDBAL:    Register = Register(0x2800);
    pub const RDBAH:    Register = Register(0x2804);
    pub const RDLEN:    Register = Register(0x2808);
    pub const RDH:      Register = Register(0x2810);
    pub const RDT:      Register = Register(0x2818);

    pub const TDBAL:    Register = Register(0x3800);
    pub const TDBAH:    Register = Register(0x3804);
    pub const TDLEN:    Register = Register(0x3808);
    pub const TDH:      Register = Register(0x3810);
    pub const TDT:      Register = Register(0x3818);

    /// Receive Address Low, entry 0
    pub const RAL0:     Register = Register(0x5400);
    /// Receive Address High, entry 0
    pub const RAH0:     Register = Register(0x5404);

    const MTA_BASE: u32 = 0x5200;

    /// Entry `n` of the Multicast Table Array, or `None` if `n >= 128`.
    pub const fn mta(n: usize) -> Option<Register> {
        if n < MTA_ENTRIES {
            Some(Register(Self::MTA_BASE + (n as u32) * 4))
        } else {
            None
        }
    }

    /// The byte offset of this register from the start of the MMIO window.
    pub const fn offset(self) -> u32 {
        self.0
    }
}

const_assert!(Register::MTA_BASE as usize + MTA_ENTRIES * 4 <= 0x5400);
const_assert!((Register::RAH0.offset() as usize) < E1000_MMIO_SIZE);

// EERD fields
/// Start Read
pub const EERD_START:       u32 = 1 << 0;
/// Read Done
pub const EERD_DONE:        u32 = 1 << 4;
pub const EERD_ADDR_SHIFT:  u32 = 8;

/// Receive Address Valid bit in RAH
pub const RAH_AV:           u32 = 1 << 31;

bitflags! {
    /// Device Control Register bits.
    pub struct Ctrl: u32 {
        /// Full Duplex
        const FD      = 1 << 0;
        /// Link Reset
        const LRST    = 1 << 3;
        /// Auto-Speed Detection Enable
        const ASDE    = 1 << 5;
        /// Set Link Up
        const SLU     = 1 << 6;
        /// Invert Loss-of-Signal
        const ILOS    = 1 << 7;
        /// Device Reset
        const RST     = 1 << 26;
        /// VLAN Mode Enable
        const VME     = 1 << 30;
        const PHY_RST = 1 << 31;
    }
}

bitflags! {
    /// Device Status Register bits.
    pub struct Status: u32 {
        /// Full Duplex
        const FD = 1 << 0;
        /// Link Up
        const LU = 1 << 1;
    }
}

bitflags! {
    /// Receive Control Register bits.
    pub struct Rctl: u32 {
        /// Receiver Enable
        const EN         = 1 << 1;
        /// Store Bad Packets
        const SBP        = 1 << 2;
        /// Unicast Promiscuous Enabled
        const UPE        = 1 << 3;
        /// Multicast Promiscuous Enabled
        const MPE        = 1 << 4;
        /// Long Packet Reception Enable
        const LPE        = 1 << 5;
        /// No Loopback
        const LBM_NONE   = 0 << 6;
        /// Free Buffer Threshold is 1/2 of RDLEN
        const RDMTS_HALF = 0 << 8;
        /// Broadcast Accept Mode
        const BAM        = 1 << 15;
        /// 2048-byte receive buffers (with BSEX clear)
        const BSIZE_2048 = 0 << 16;
        /// Strip Ethernet CRC
        const SECRC      = 1 << 26;
    }
}

bitflags! {
    /// Transmit Control Register bits.
    pub struct Tctl: u32 {
        /// Transmit Enable
        const EN  = 1 << 1;
        /// Pad Short Packets
        const PSP = 1 << 3;
    }
}

bitflags! {
    /// Interrupt cause bits, shared by ICR, IMS and IMC.
    pub struct InterruptCause: u32 {
        /// Transmit Descriptor Written Back
        const TXDW   = 1 << 0;
        /// Transmit Queue Empty
        const TXQE   = 1 << 1;
        /// Link Status Change
        const LSC    = 1 << 2;
        /// Receive Sequence Error
        const RXSEQ  = 1 << 3;
        /// Receive Descriptor Minimum Threshold Reached
        const RXDMT0 = 1 << 4;
        /// Receiver Overrun
        const RXO    = 1 << 6;
        /// Receiver Timer Interrupt
        const RXT0   = 1 << 7;
    }
}

/// The receive configuration written before the receiver is enabled:
/// store bad packets, promiscuous unicast and multicast, strip the CRC,
/// accept long packets and broadcasts, 2 KiB buffers.
pub const RCTL_CONFIG: Rctl = Rctl::from_bits_truncate(
    Rctl::SBP.bits()
    | Rctl::UPE.bits()
    | Rctl::MPE.bits()
    | Rctl::RDMTS_HALF.bits()
    | Rctl::SECRC.bits()
    | Rctl::LPE.bits()
    | Rctl::BAM.bits()
    | Rctl::BSIZE_2048.bits()
);

/// Transmit enabled, short packets padded to the minimum frame size.
pub const TCTL_CONFIG: Tctl = Tctl::from_bits_truncate(Tctl::EN.bits() | Tctl::PSP.bits());

/// The receive buffer size implied by `Rctl::BSIZE_2048`.
pub const E1000_RX_BUFFER_SIZE_IN_BYTES: u16 = 2048;
