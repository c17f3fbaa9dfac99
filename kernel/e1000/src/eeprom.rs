//! Reading words from the e1000's EEPROM through the EERD register.

use bit_field::BitField;
use time::{poll_until, Delay, PollPolicy};
use zerocopy::{byteorder::{LittleEndian, U16}, AsBytes};
use crate::{
    error::E1000Error,
    mmio::{E1000Registers, RegisterBackend},
    regs::{Register, EERD_ADDR_SHIFT, EERD_DONE, EERD_START},
    MacAddress,
};

/// EEPROM word addresses that hold the station (MAC) address.
const MAC_ADDRESS_WORDS: [u8; 3] = [0, 1, 2];

/// Issues EEPROM reads and waits for them with a bounded poll.
pub struct EepromReader<'r, B: RegisterBackend> {
    regs: &'r E1000Registers<B>,
    policy: PollPolicy,
    delay: &'r dyn Delay,
}

impl<'r, B: RegisterBackend> EepromReader<'r, B> {
    pub fn new(regs: &'r E1000Registers<B>, policy: PollPolicy, delay: &'r dyn Delay) -> EepromReader<'r, B> {
        EepromReader { regs, policy, delay }
    }

    /// Reads the 16-bit word at `address`.
    ///
    /// Returns [`E1000Error::EepromTimeout`] if the device doesn't set the done bit
    /// within the configured number of polls.
    pub fn read_word(&self, address: u8) -> Result<u16, E1000Error> {
        self.regs.write(Register::EERD, EERD_START | (u32::from(address) << EERD_ADDR_SHIFT));
        let eerd = poll_until(&self.policy, self.delay, || {
            let eerd = self.regs.read(Register::EERD);
            (eerd & EERD_DONE != 0).then_some(eerd)
        })
        .map_err(|timeout| {
            error!("e1000: EEPROM read of word {} timed out after {} polls", address, timeout.attempts);
            E1000Error::EepromTimeout { address }
        })?;
        Ok(eerd.get_bits(16..32) as u16)
    }

    /// Reads the factory station address, stored as three little-endian words.
    pub fn read_mac(&self) -> Result<MacAddress, E1000Error> {
        let mut words = [U16::<LittleEndian>::new(0); 3];
        for (word, &address) in words.iter_mut().zip(MAC_ADDRESS_WORDS.iter()) {
            *word = U16::new(self.read_word(address)?);
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(words.as_bytes());
        Ok(mac)
    }
}
