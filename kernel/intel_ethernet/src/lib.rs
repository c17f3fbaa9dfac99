//! Hardware structures shared by Intel Ethernet controllers.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;

pub mod descriptors;
