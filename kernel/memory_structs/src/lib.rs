//! This crate contains the basic address types used by NIC drivers.
//!
//! A [`PhysicalAddress`] is what a device's DMA engine sees;
//! a [`VirtualAddress`] is what the CPU dereferences.
//! The two types never convert into each other implicitly:
//! the only place a physical address is derived from a virtual one
//! is the DMA allocator that handed out the memory in the first place.

#![cfg_attr(not(test), no_std)]

use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
use derive_more::*;
use paste::paste;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The size in bytes of one page (and of one physical frame).
pub const PAGE_SIZE: usize = 4096;

/// A macro for defining `VirtualAddress` and `PhysicalAddress` structs
/// and implementing their common traits, which are generally identical.
macro_rules! implement_address {
    ($TypeName:ident, $desc:literal, $prefix:literal, $is_canonical:ident, $canonicalize:ident) => {
        paste! {
            #[doc = "A " $desc " memory address, which is a `usize` under the hood."]
            #[derive(
                Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
                Binary, Octal, LowerHex, UpperHex,
                FromZeroes, FromBytes, AsBytes,
            )]
            #[repr(transparent)]
            pub struct $TypeName(usize);

            impl $TypeName {
                #[doc = "Creates a new `" $TypeName "`, returning `None` if the address is not canonical."]
                pub fn new(addr: usize) -> Option<$TypeName> {
                    if $is_canonical(addr) { Some($TypeName(addr)) } else { None }
                }

                #[doc = "Creates a new `" $TypeName "` that is guaranteed to be canonical."]
                pub const fn new_canonical(addr: usize) -> $TypeName {
                    $TypeName($canonicalize(addr))
                }

                #[doc = "Creates a new `" $TypeName "` with a value 0."]
                pub const fn zero() -> $TypeName {
                    $TypeName(0)
                }

                #[doc = "Returns the underlying `usize` value for this `" $TypeName "`."]
                #[inline]
                pub const fn value(&self) -> usize {
                    self.0
                }

                #[doc = "Returns `true` if this `" $TypeName "` is zero."]
                #[inline]
                pub const fn is_zero(&self) -> bool {
                    self.0 == 0
                }

                #[doc = "Returns the offset of this `" $TypeName "` from the start of its page."]
                pub const fn page_offset(&self) -> usize {
                    self.0 & (PAGE_SIZE - 1)
                }
            }

            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, concat!($prefix, "{:#X}"), self.0)
                }
            }
            impl fmt::Display for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{:?}", self)
                }
            }
            impl Add<usize> for $TypeName {
                type Output = $TypeName;
                fn add(self, rhs: usize) -> $TypeName {
                    $TypeName::new_canonical(self.0.saturating_add(rhs))
                }
            }
            impl AddAssign<usize> for $TypeName {
                fn add_assign(&mut self, rhs: usize) {
                    *self = $TypeName::new_canonical(self.0.saturating_add(rhs));
                }
            }
            impl Sub<usize> for $TypeName {
                type Output = $TypeName;
                fn sub(self, rhs: usize) -> $TypeName {
                    $TypeName::new_canonical(self.0.saturating_sub(rhs))
                }
            }
            impl SubAssign<usize> for $TypeName {
                fn sub_assign(&mut self, rhs: usize) {
                    *self = $TypeName::new_canonical(self.0.saturating_sub(rhs));
                }
            }
        }
    };
}

#[cfg(not(target_arch = "aarch64"))]
mod canonical_address {
    use bit_field::BitField;

    #[inline]
    pub fn is_canonical_virtual_address(virt_addr: usize) -> bool {
        matches!(virt_addr.get_bits(47..64), 0 | 0b1_1111_1111_1111_1111)
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        // sign-extend bit 47 into the upper 16 bits
        ((virt_addr << 16) as isize >> 16) as usize
    }

    #[inline]
    pub fn is_canonical_physical_address(phys_addr: usize) -> bool {
        matches!(phys_addr.get_bits(52..64), 0)
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr & 0x000F_FFFF_FFFF_FFFF
    }
}

#[cfg(target_arch = "aarch64")]
mod canonical_address {
    use bit_field::BitField;

    /// With an ASID of zero, a canonical VA has its 16 most significant bits cleared.
    #[inline]
    pub fn is_canonical_virtual_address(virt_addr: usize) -> bool {
        matches!(virt_addr.get_bits(48..64), 0)
    }

    #[inline]
    pub const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
        virt_addr & 0x0000_FFFF_FFFF_FFFF
    }

    /// The MMU is configured for 48-bit physical addresses.
    #[inline]
    pub fn is_canonical_physical_address(phys_addr: usize) -> bool {
        matches!(phys_addr.get_bits(48..64), 0)
    }

    #[inline]
    pub const fn canonicalize_physical_address(phys_addr: usize) -> usize {
        phys_addr & 0x0000_FFFF_FFFF_FFFF
    }
}

use canonical_address::*;

implement_address!(
    VirtualAddress,
    "virtual",
    "v",
    is_canonical_virtual_address,
    canonicalize_virtual_address
);

implement_address!(
    PhysicalAddress,
    "physical",
    "p",
    is_canonical_physical_address,
    canonicalize_physical_address
);

impl PhysicalAddress {
    /// Returns the lower (least significant) 32 bits of this address,
    /// as written into a `*BAL` base-address register.
    #[inline]
    pub const fn low_u32(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the higher (most significant) 32 bits of this address,
    /// as written into a `*BAH` base-address register.
    #[inline]
    pub const fn high_u32(&self) -> u32 {
        ((self.0 as u64) >> 32) as u32
    }

    /// Returns this address as the 64-bit value stored in a hardware descriptor.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0 as u64
    }
}

impl VirtualAddress {
    /// Returns this address as a raw pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}
