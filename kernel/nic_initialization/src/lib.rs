//! Functions that are used in a NIC initialization procedure.
//!
//! They include filling the receive buffer pool, and creating the receive and transmit descriptor rings
//! and publishing them to the device's queue registers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use alloc::{sync::Arc, vec::Vec};
use core::mem::size_of;
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{BufferPool, DescriptorRing, DmaAllocator, ReceiveBuffer};
use nic_queues::{RxQueueRegisters, TxQueueRegisters};

/// Initialize the receive buffer pool from where receive buffers are taken and returned
///
/// # Arguments
/// * `num_rx_buffers`: number of buffers that are initially added to the pool
/// * `rx_buffer_pool`: buffer pool to initialize
/// * `allocator`: source of the DMA memory for the buffers
pub fn init_rx_buf_pool(num_rx_buffers: usize, rx_buffer_pool: &BufferPool, allocator: &dyn DmaAllocator) -> Result<(), &'static str> {
    if num_rx_buffers > rx_buffer_pool.capacity() {
        error!("init_rx_buf_pool(): rx buffer pool can't hold {} buffers (capacity {})", num_rx_buffers, rx_buffer_pool.capacity());
        return Err("nic rx buffer pool is too small");
    }
    rx_buffer_pool.fill(num_rx_buffers, allocator)
}

/// Allocates DMA memory for `num_desc` descriptors of type `T`.
fn allocate_descriptor_ring<T>(num_desc: usize, allocator: &dyn DmaAllocator) -> Result<DescriptorRing<T>, &'static str> {
    let size_in_bytes = num_desc.checked_mul(size_of::<T>()).ok_or("descriptor ring size overflowed")?;
    // Descriptor rings must be 128 byte-aligned, which is satisfied because the allocator returns whole pages.
    let memory = allocator.allocate_dma(size_in_bytes)?;
    // SAFETY: descriptors are plain hardware structures made of integer fields,
    // and the allocator hands out zeroed memory.
    unsafe { DescriptorRing::new(memory, num_desc) }
}

/// Steps to create and initialize a receive descriptor queue
///
/// Every descriptor is given a buffer and the whole ring is handed to the device,
/// so the tail is set to `num_desc`.
///
/// # Arguments
/// * `num_desc`: number of descriptors in the queue
/// * `rx_buffer_pool`: pool from which to take receive buffers
/// * `allocator`: source of the ring memory, and of receive buffers when the pool is empty
/// * `rxq_regs`: registers needed to set up a receive queue
pub fn init_rx_queue<T: RxDescriptor, S: RxQueueRegisters>(
    num_desc: usize,
    rx_buffer_pool: &Arc<BufferPool>,
    allocator: &dyn DmaAllocator,
    rxq_regs: &mut S,
) -> Result<(DescriptorRing<T>, Vec<ReceiveBuffer>), &'static str> {
    let num_desc_u32 = u32::try_from(num_desc).map_err(|_| "too many receive descriptors")?;
    let mut rx_descs = allocate_descriptor_ring::<T>(num_desc, allocator)?;

    // now that we've created the rx descriptors, we can fill them in with initial values
    let mut rx_bufs_in_use: Vec<ReceiveBuffer> = Vec::with_capacity(num_desc);
    for rd in rx_descs.iter_mut() {
        // obtain or create a receive buffer for each rx_desc
        let rx_buf = ReceiveBuffer::from_pool(rx_buffer_pool, allocator)?;
        rd.init(rx_buf.phys_addr());
        rx_bufs_in_use.push(rx_buf);
    }

    let ring_paddr = rx_descs.phys_addr();
    debug!("init_rx_queue(): phys_addr of rx_desc: {:#X}", ring_paddr);

    // write the physical address of the rx descs ring
    rxq_regs.set_rdbal(ring_paddr.low_u32());
    rxq_regs.set_rdbah(ring_paddr.high_u32());

    // write the length (in total bytes) of the rx descs array
    rxq_regs.set_rdlen(rx_descs.size_in_bytes() as u32);

    // write the head index and the tail index, giving every descriptor to the device
    rxq_regs.set_rdh(0);
    rxq_regs.set_rdt(num_desc_u32);

    Ok((rx_descs, rx_bufs_in_use))
}

/// Steps to create and initialize a transmit descriptor queue
///
/// # Arguments
/// * `num_desc`: number of descriptors in the queue
/// * `allocator`: source of the ring memory
/// * `txq_regs`: registers needed to set up a transmit queue
pub fn init_tx_queue<T: TxDescriptor, S: TxQueueRegisters>(
    num_desc: usize,
    allocator: &dyn DmaAllocator,
    txq_regs: &mut S,
) -> Result<DescriptorRing<T>, &'static str> {
    let num_desc_u32 = u32::try_from(num_desc).map_err(|_| "too many transmit descriptors")?;
    let mut tx_descs = allocate_descriptor_ring::<T>(num_desc, allocator)?;

    // no buffers are attached yet, so every descriptor starts out cleared
    for td in tx_descs.iter_mut() {
        td.init();
    }

    let ring_paddr = tx_descs.phys_addr();
    debug!("init_tx_queue(): phys_addr of tx_desc: {:#X}", ring_paddr);

    // write the physical address of the tx descs array
    txq_regs.set_tdbal(ring_paddr.low_u32());
    txq_regs.set_tdbah(ring_paddr.high_u32());

    // write the length (in total bytes) of the tx descs array
    txq_regs.set_tdlen(tx_descs.size_in_bytes() as u32);

    txq_regs.set_tdh(0);
    txq_regs.set_tdt(num_desc_u32);

    Ok(tx_descs)
}
