//! Receive and transmit queues of a NIC and the protocol for exchanging packets through them.
//!
//! A queue owns its descriptor ring, the buffers currently attached to that ring,
//! and a handle to the registers that hold the ring's head and tail.
//! All operations take `&mut self`, so advancing a tail is always serialized
//! by whoever owns the queue.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::mem;
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use derive_more::Display;
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{BufferPool, DescriptorRing, DmaAllocator, ReceiveBuffer, ReceivedFrame, TransmitBuffer};
use time::{poll_until, Delay, PollPolicy};

/// The set of functions required by a NIC to program one receive queue.
pub trait RxQueueRegisters {
    /// Sets the lower 32 bits of the physical address of the receive descriptor ring.
    fn set_rdbal(&mut self, value: u32);
    /// Sets the upper 32 bits of the physical address of the receive descriptor ring.
    fn set_rdbah(&mut self, value: u32);
    /// Sets the size in bytes of the receive descriptor ring.
    fn set_rdlen(&mut self, value: u32);
    /// Sets the receive descriptor head index.
    fn set_rdh(&mut self, value: u32);
    /// Sets the receive descriptor tail index.
    fn set_rdt(&mut self, value: u32);
}

/// The set of functions required by a NIC to program one transmit queue.
pub trait TxQueueRegisters {
    /// Sets the lower 32 bits of the physical address of the transmit descriptor ring.
    fn set_tdbal(&mut self, value: u32);
    /// Sets the upper 32 bits of the physical address of the transmit descriptor ring.
    fn set_tdbah(&mut self, value: u32);
    /// Sets the size in bytes of the transmit descriptor ring.
    fn set_tdlen(&mut self, value: u32);
    /// Sets the transmit descriptor head index.
    fn set_tdh(&mut self, value: u32);
    /// Sets the transmit descriptor tail index.
    fn set_tdt(&mut self, value: u32);
}

/// Errors that can occur while exchanging packets through a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NicQueueError {
    /// Every usable transmit descriptor still holds a packet the device hasn't sent.
    #[display(fmt = "transmit queue is full")]
    QueueFull,
    /// The device did not report a transmit descriptor as done in time.
    #[display(fmt = "transmit descriptor {} not completed after {} polls", index, attempts)]
    TxCompletionTimeout { index: u16, attempts: u32 },
    /// No buffer could be found to re-arm a receive descriptor with.
    #[display(fmt = "no receive buffer available to re-arm descriptor {}", index)]
    ReceiveBufferUnavailable { index: u16 },
    /// A descriptor index beyond the end of the ring.
    #[display(fmt = "descriptor index {} is out of range", _0)]
    InvalidIndex(u16),
    /// The packet does not fit into a single transmit buffer.
    #[display(fmt = "packet of {} bytes does not fit in a transmit buffer", _0)]
    PacketTooLarge(usize),
    /// Transmit descriptors must carry at least one byte.
    #[display(fmt = "cannot send an empty packet")]
    EmptyPacket,
}

/// A struct that holds all information for one receive queue.
pub struct RxQueue<S: RxQueueRegisters, T: RxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    /// Registers for this receive queue
    pub regs: S,
    /// Receive descriptors
    pub rx_descs: DescriptorRing<T>,
    /// The number of receive descriptors in the descriptor ring
    pub num_rx_descs: u16,
    /// Current receive descriptor index
    pub rx_cur: u16,
    /// The list of rx buffers, in which the index in the vector corresponds to the index in `rx_descs`.
    /// For example, `rx_bufs_in_use[2]` is the receive buffer that will be used when `rx_descs[2]` is the current rx descriptor (rx_cur = 2).
    pub rx_bufs_in_use: Vec<ReceiveBuffer>,
    /// The size of every receive buffer, as configured in the device
    pub rx_buffer_size_bytes: u16,
    /// The queue of received Ethernet frames, ready for consumption by a higher layer.
    /// Newly-received frames are pushed onto the back and frames are popped off of the front.
    pub received_frames: VecDeque<ReceivedFrame>,
    /// Once `received_frames` holds this many frames, no more descriptors are consumed.
    pub max_pending_frames: usize,
    /// Pool from which replacement receive buffers are taken
    pub rx_buffer_pool: Arc<BufferPool>,
    /// Used when `rx_buffer_pool` has run dry
    allocator: Arc<dyn DmaAllocator>,
    /// Buffers of a frame whose last descriptor hasn't completed yet
    frame_in_progress: Vec<ReceiveBuffer>,
    /// Set after an invalid descriptor, until the rest of its frame has gone by
    discarding_frame: bool,
    /// How many completed descriptors were rejected because of hardware-reported errors or bad lengths
    pub invalid_descriptors: u64,
}

impl<S: RxQueueRegisters, T: RxDescriptor> RxQueue<S, T> {
    /// Creates a receive queue around an already-initialized descriptor ring.
    ///
    /// `rx_bufs_in_use[i]` must be the buffer whose address is programmed into `rx_descs[i]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u8,
        regs: S,
        rx_descs: DescriptorRing<T>,
        rx_bufs_in_use: Vec<ReceiveBuffer>,
        rx_buffer_size_bytes: u16,
        rx_buffer_pool: Arc<BufferPool>,
        allocator: Arc<dyn DmaAllocator>,
        max_pending_frames: usize,
    ) -> Result<RxQueue<S, T>, &'static str> {
        if rx_bufs_in_use.len() != rx_descs.len() {
            return Err("RxQueue::new(): need exactly one receive buffer per descriptor");
        }
        let num_rx_descs = u16::try_from(rx_descs.len())
            .map_err(|_| "RxQueue::new(): too many receive descriptors")?;
        Ok(RxQueue {
            id,
            regs,
            rx_descs,
            num_rx_descs,
            rx_cur: 0,
            rx_bufs_in_use,
            rx_buffer_size_bytes,
            received_frames: VecDeque::with_capacity(max_pending_frames),
            max_pending_frames,
            rx_buffer_pool,
            allocator,
            frame_in_progress: Vec::new(),
            discarding_frame: false,
            invalid_descriptors: 0,
        })
    }

    /// Hands the descriptor at `index` back to the device and moves on to the next one.
    fn give_back_and_advance(&mut self, index: u16) {
        self.regs.set_rdt(u32::from(index));
        self.rx_cur = (index + 1) % self.num_rx_descs;
    }

    /// Checks whether the device reported the descriptor at `index` as properly filled.
    fn descriptor_is_valid(&self, index: usize) -> bool {
        let desc = &self.rx_descs[index];
        let length = desc.length();
        let errors = desc.errors();
        if !errors.is_empty() {
            warn!("RxQueue {}: descriptor {} reported errors {:?}", self.id, index, errors);
            return false;
        }
        if length > u64::from(self.rx_buffer_size_bytes) {
            warn!("RxQueue {}: descriptor {} reported length {} larger than its buffer", self.id, index, length);
            return false;
        }
        if length == 0 && desc.end_of_packet() {
            warn!("RxQueue {}: descriptor {} ended a frame with zero length", self.id, index);
            return false;
        }
        true
    }

    /// Consumes every descriptor the device has completed, starting at `rx_cur`.
    ///
    /// Each filled buffer is swapped out for a fresh one from the pool,
    /// its descriptor is re-armed and handed back to the device,
    /// and completed frames are appended to `received_frames`.
    /// Stops early once `received_frames` is full, leaving the remaining
    /// completed descriptors with software until frames are consumed.
    ///
    /// Returns the number of frames that were delivered.
    pub fn poll_queue_and_store_received_packets(&mut self) -> Result<usize, NicQueueError> {
        let mut frames_delivered = 0;
        loop {
            let cur = self.rx_cur;
            let idx = usize::from(cur);
            if !self.rx_descs[idx].descriptor_done() {
                break;
            }
            if self.received_frames.len() >= self.max_pending_frames {
                debug!("RxQueue {}: {} frames pending, leaving descriptor {} for later", self.id, self.received_frames.len(), cur);
                break;
            }

            let end_of_packet = self.rx_descs[idx].end_of_packet();

            if !self.descriptor_is_valid(idx) {
                self.invalid_descriptors += 1;
                if !self.frame_in_progress.is_empty() {
                    warn!("RxQueue {}: dropping partial frame of {} buffers", self.id, self.frame_in_progress.len());
                    self.frame_in_progress.clear();
                }
                self.discarding_frame = !end_of_packet;
                self.rx_descs[idx].reset_status();
                self.give_back_and_advance(cur);
                continue;
            }

            if self.discarding_frame {
                // the tail of a frame that already had an invalid descriptor
                self.discarding_frame = !end_of_packet;
                self.rx_descs[idx].reset_status();
                self.give_back_and_advance(cur);
                continue;
            }

            let length = self.rx_descs[idx].length() as u16;
            trace!("RxQueue {}: received rx buffer [{}]: length: {}", self.id, cur, length);

            // Before "removing" the current receive buffer, obtain a new one for the device to fill in the future.
            let new_receive_buf = match ReceiveBuffer::from_pool(&self.rx_buffer_pool, &*self.allocator) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("RxQueue {}: couldn't obtain a replacement receive buffer: {}", self.id, e);
                    return Err(NicQueueError::ReceiveBufferUnavailable { index: cur });
                }
            };

            // tell the device about the new receive buffer, and that it's ready for use now
            self.rx_descs[idx].set_packet_address(new_receive_buf.phys_addr());
            self.rx_descs[idx].reset_status();

            // swap in the new receive buffer, getting back the one that is part of the received frame
            let mut current_rx_buf = mem::replace(&mut self.rx_bufs_in_use[idx], new_receive_buf);
            if current_rx_buf.set_length(length).is_err() {
                // can't happen, the length was validated against the buffer size
                warn!("RxQueue {}: couldn't trim receive buffer to {} bytes", self.id, length);
            }
            self.frame_in_progress.push(current_rx_buf);

            if end_of_packet {
                let buffers = mem::take(&mut self.frame_in_progress);
                self.received_frames.push_back(ReceivedFrame(buffers));
                frames_delivered += 1;
            }

            self.give_back_and_advance(cur);
        }
        Ok(frames_delivered)
    }

    /// Removes the oldest received frame from this queue.
    pub fn return_frame(&mut self) -> Option<ReceivedFrame> {
        self.received_frames.pop_front()
    }
}

/// A struct that holds all information for a transmit queue.
pub struct TxQueue<S: TxQueueRegisters, T: TxDescriptor> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    /// Registers for this transmit queue
    pub regs: S,
    /// Transmit descriptors
    pub tx_descs: DescriptorRing<T>,
    /// The number of transmit descriptors in the descriptor ring
    pub num_tx_descs: u16,
    /// The descriptor that the next packet will be placed in
    pub tx_cur: u16,
    /// The oldest descriptor that may still be in flight
    pub tx_clean: u16,
    /// The buffer attached to each descriptor, until the device is done with it
    tx_bufs_in_use: Vec<Option<TransmitBuffer>>,
    in_flight: u16,
    completion_policy: PollPolicy,
    delay: Arc<dyn Delay>,
}

impl<S: TxQueueRegisters, T: TxDescriptor> TxQueue<S, T> {
    /// Creates a transmit queue around an already-initialized descriptor ring.
    pub fn new(
        id: u8,
        regs: S,
        tx_descs: DescriptorRing<T>,
        completion_policy: PollPolicy,
        delay: Arc<dyn Delay>,
    ) -> Result<TxQueue<S, T>, &'static str> {
        let num_tx_descs = u16::try_from(tx_descs.len())
            .map_err(|_| "TxQueue::new(): too many transmit descriptors")?;
        if num_tx_descs < 2 {
            return Err("TxQueue::new(): a transmit ring needs at least two descriptors");
        }
        let mut tx_bufs_in_use = Vec::with_capacity(tx_descs.len());
        tx_bufs_in_use.resize_with(tx_descs.len(), || None);
        Ok(TxQueue {
            id,
            regs,
            tx_descs,
            num_tx_descs,
            tx_cur: 0,
            tx_clean: 0,
            tx_bufs_in_use,
            in_flight: 0,
            completion_policy,
            delay,
        })
    }

    /// The number of packets handed to the device that it hasn't reported as sent yet.
    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }

    /// Releases the buffers of all descriptors the device has finished sending, oldest first.
    ///
    /// Returns the number of descriptors reclaimed.
    pub fn reclaim_completed(&mut self) -> usize {
        let mut reclaimed = 0;
        while self.in_flight > 0 {
            let idx = usize::from(self.tx_clean);
            if !self.tx_descs[idx].descriptor_done() {
                break;
            }
            // dropping the buffer returns it to its pool
            drop(self.tx_bufs_in_use[idx].take());
            self.tx_clean = (self.tx_clean + 1) % self.num_tx_descs;
            self.in_flight -= 1;
            reclaimed += 1;
        }
        reclaimed
    }

    /// Places `transmit_buffer` in the next free descriptor and hands it to the device.
    ///
    /// One descriptor is always kept free so that a full ring can't be mistaken for an empty one.
    /// If no descriptor is free, returns [`NicQueueError::QueueFull`] along with the buffer,
    /// so the caller can retry once the device has caught up.
    ///
    /// Returns the index of the descriptor used.
    pub fn send_on_queue(&mut self, transmit_buffer: TransmitBuffer) -> Result<u16, (NicQueueError, TransmitBuffer)> {
        if transmit_buffer.length() == 0 {
            return Err((NicQueueError::EmptyPacket, transmit_buffer));
        }
        self.reclaim_completed();
        if self.in_flight >= self.num_tx_descs - 1 {
            debug!("TxQueue {}: no free descriptor, {} packets in flight", self.id, self.in_flight);
            return Err((NicQueueError::QueueFull, transmit_buffer));
        }

        let cur = self.tx_cur;
        let idx = usize::from(cur);
        self.tx_descs[idx].send(transmit_buffer.phys_addr(), transmit_buffer.length());
        self.tx_bufs_in_use[idx] = Some(transmit_buffer);
        self.in_flight += 1;

        // update the tx_cur value to hold the next free descriptor
        self.tx_cur = (cur + 1) % self.num_tx_descs;
        // update the tdt register by 1 so that it knows the previous descriptor has been used
        // and has a packet to be sent
        self.regs.set_tdt(u32::from(self.tx_cur));
        Ok(cur)
    }

    /// Waits until the device reports the descriptor at `index` as done,
    /// giving up after the configured number of polls.
    pub fn wait_for_tx_completion(&self, index: u16) -> Result<(), NicQueueError> {
        if index >= self.num_tx_descs {
            return Err(NicQueueError::InvalidIndex(index));
        }
        let desc = &self.tx_descs[usize::from(index)];
        poll_until(&self.completion_policy, &*self.delay, || desc.descriptor_done().then_some(()))
            .map_err(|timeout| {
                error!("TxQueue {}: descriptor {} not done: {}", self.id, index, timeout);
                NicQueueError::TxCompletionTimeout { index, attempts: timeout.attempts }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::alloc::{alloc_zeroed, Layout};
    use intel_ethernet::descriptors::{LegacyRxDescriptor, LegacyTxDescriptor, RxErrors, RxStatus, TxCommand};
    use memory_structs::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
    use nic_buffers::{page_align_up, DmaBuffer};
    use time::Duration;

    struct HeapDma;

    impl DmaAllocator for HeapDma {
        fn allocate_dma(&self, size_in_bytes: usize) -> Result<DmaBuffer, &'static str> {
            let size = page_align_up(size_in_bytes);
            let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| "bad layout")?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err("out of memory");
            }
            let vaddr = VirtualAddress::new(ptr as usize).ok_or("bad vaddr")?;
            let paddr = PhysicalAddress::new(ptr as usize).ok_or("bad paddr")?;
            Ok(unsafe { DmaBuffer::from_raw_parts(vaddr, paddr, size) })
        }
    }

    /// Succeeds only for the first `remaining` allocations.
    struct LimitedDma {
        remaining: AtomicU32,
    }

    impl DmaAllocator for LimitedDma {
        fn allocate_dma(&self, size_in_bytes: usize) -> Result<DmaBuffer, &'static str> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err("DMA memory exhausted");
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            HeapDma.allocate_dma(size_in_bytes)
        }
    }

    #[derive(Default)]
    struct CountingDelay {
        calls: AtomicU32,
    }

    impl Delay for CountingDelay {
        fn delay(&self, _duration: Duration) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TailLog {
        tails: Vec<u32>,
    }

    impl RxQueueRegisters for TailLog {
        fn set_rdbal(&mut self, _value: u32) {}
        fn set_rdbah(&mut self, _value: u32) {}
        fn set_rdlen(&mut self, _value: u32) {}
        fn set_rdh(&mut self, _value: u32) {}
        fn set_rdt(&mut self, value: u32) {
            self.tails.push(value);
        }
    }

    impl TxQueueRegisters for TailLog {
        fn set_tdbal(&mut self, _value: u32) {}
        fn set_tdbah(&mut self, _value: u32) {}
        fn set_tdlen(&mut self, _value: u32) {}
        fn set_tdh(&mut self, _value: u32) {}
        fn set_tdt(&mut self, value: u32) {
            self.tails.push(value);
        }
    }

    const BUF_SIZE: u16 = 2048;

    fn rx_queue(num_descs: usize, max_pending_frames: usize, allocator: Arc<dyn DmaAllocator>) -> RxQueue<TailLog, LegacyRxDescriptor> {
        rx_queue_with_pool(num_descs, max_pending_frames, 64, allocator)
    }

    fn rx_queue_with_pool(
        num_descs: usize,
        max_pending_frames: usize,
        pool_capacity: usize,
        allocator: Arc<dyn DmaAllocator>,
    ) -> RxQueue<TailLog, LegacyRxDescriptor> {
        let memory = HeapDma.allocate_dma(num_descs * 16).unwrap();
        let mut ring = unsafe { DescriptorRing::<LegacyRxDescriptor>::new(memory, num_descs) }.unwrap();
        let pool = Arc::new(BufferPool::new(pool_capacity, usize::from(BUF_SIZE)));
        let mut bufs = Vec::new();
        for desc in ring.iter_mut() {
            let buf = ReceiveBuffer::from_pool(&pool, &HeapDma).unwrap();
            desc.init(buf.phys_addr());
            bufs.push(buf);
        }
        RxQueue::new(0, TailLog::default(), ring, bufs, BUF_SIZE, pool, allocator, max_pending_frames).unwrap()
    }

    fn tx_queue(num_descs: usize) -> TxQueue<TailLog, LegacyTxDescriptor> {
        let memory = HeapDma.allocate_dma(num_descs * 16).unwrap();
        let mut ring = unsafe { DescriptorRing::<LegacyTxDescriptor>::new(memory, num_descs) }.unwrap();
        for desc in ring.iter_mut() {
            desc.init();
        }
        let policy = PollPolicy::new(5, Duration::from_micros(1));
        TxQueue::new(0, TailLog::default(), ring, policy, Arc::new(CountingDelay::default())).unwrap()
    }

    /// Plays the device: copies `payload` into the buffer of descriptor `idx` and writes back its status.
    fn device_receive(rxq: &mut RxQueue<TailLog, LegacyRxDescriptor>, idx: usize, payload: &[u8], status: RxStatus, errors: RxErrors) {
        let desc = &mut rxq.rx_descs[idx];
        let buf_addr = desc.packet_address() as usize;
        let raw = desc as *mut LegacyRxDescriptor as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(payload.as_ptr(), buf_addr as *mut u8, payload.len());
            core::ptr::write_volatile(raw.add(8) as *mut u16, payload.len() as u16);
            core::ptr::write_volatile(raw.add(13), errors.bits());
            core::ptr::write_volatile(raw.add(12), status.bits());
        }
    }

    fn device_transmitted(txq: &mut TxQueue<TailLog, LegacyTxDescriptor>, idx: usize) {
        txq.tx_descs[idx].status.write(1);
    }

    fn pooled_tx_buffer(pool: &Arc<BufferPool>, len: u16) -> TransmitBuffer {
        TransmitBuffer::from_pool(pool, &HeapDma, len).unwrap()
    }

    #[test]
    fn completed_frame_is_delivered_and_descriptor_rearmed() {
        let mut rxq = rx_queue(8, 4, Arc::new(HeapDma));
        let old_addr = rxq.rx_descs[0].packet_address();
        device_receive(&mut rxq, 0, &[0xAA; 60], RxStatus::DD | RxStatus::EOP, RxErrors::empty());

        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        assert_eq!(rxq.rx_cur, 1);
        assert_eq!(rxq.regs.tails, vec![0]);
        assert!(!rxq.rx_descs[0].descriptor_done());
        assert_ne!(rxq.rx_descs[0].packet_address(), old_addr);
        assert_eq!(rxq.rx_descs[0].packet_address(), rxq.rx_bufs_in_use[0].phys_addr().as_u64());

        let frame = rxq.return_frame().unwrap();
        assert_eq!(frame.0.len(), 1);
        assert_eq!(frame.0[0].phys_addr().as_u64(), old_addr);
        assert_eq!(frame.to_vec(), vec![0xAA; 60]);
        assert!(rxq.return_frame().is_none());
    }

    #[test]
    fn multi_buffer_frame_is_gathered_until_eop() {
        let mut rxq = rx_queue(8, 4, Arc::new(HeapDma));
        device_receive(&mut rxq, 0, &[1; 2048], RxStatus::DD, RxErrors::empty());
        device_receive(&mut rxq, 1, &[2; 100], RxStatus::DD | RxStatus::EOP, RxErrors::empty());

        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        let frame = rxq.return_frame().unwrap();
        assert_eq!(frame.0.len(), 2);
        assert_eq!(frame.total_length(), 2148);
        assert_eq!(rxq.regs.tails, vec![0, 1]);
    }

    #[test]
    fn nothing_happens_without_completed_descriptors() {
        let mut rxq = rx_queue(8, 4, Arc::new(HeapDma));
        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(0));
        assert!(rxq.regs.tails.is_empty());
        assert_eq!(rxq.rx_cur, 0);
    }

    #[test]
    fn cursor_wraps_around_the_ring() {
        let mut rxq = rx_queue(4, 16, Arc::new(HeapDma));
        for round in 0..2 {
            for idx in 0..4 {
                device_receive(&mut rxq, idx, &[round as u8; 64], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
            }
            assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(4));
            assert_eq!(rxq.rx_cur, 0);
        }
        assert_eq!(rxq.received_frames.len(), 8);
        assert_eq!(rxq.regs.tails, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn invalid_descriptors_are_counted_and_recycled_in_place() {
        let mut rxq = rx_queue(8, 4, Arc::new(HeapDma));
        let addr0 = rxq.rx_descs[0].packet_address();
        device_receive(&mut rxq, 0, &[0; 60], RxStatus::DD | RxStatus::EOP, RxErrors::CE);
        device_receive(&mut rxq, 1, &[], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        device_receive(&mut rxq, 2, &[3; 60], RxStatus::DD | RxStatus::EOP, RxErrors::empty());

        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        assert_eq!(rxq.invalid_descriptors, 2);
        assert_eq!(rxq.rx_descs[0].packet_address(), addr0);
        assert!(!rxq.rx_descs[0].descriptor_done());
        assert_eq!(rxq.regs.tails, vec![0, 1, 2]);
        assert_eq!(rxq.return_frame().unwrap().to_vec(), vec![3; 60]);
    }

    #[test]
    fn invalid_descriptor_drops_the_whole_frame() {
        let mut rxq = rx_queue(8, 4, Arc::new(HeapDma));
        device_receive(&mut rxq, 0, &[1; 2048], RxStatus::DD, RxErrors::empty());
        device_receive(&mut rxq, 1, &[2; 2048], RxStatus::DD, RxErrors::RXE);
        device_receive(&mut rxq, 2, &[3; 10], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        device_receive(&mut rxq, 3, &[4; 10], RxStatus::DD | RxStatus::EOP, RxErrors::empty());

        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        assert_eq!(rxq.invalid_descriptors, 1);
        assert_eq!(rxq.return_frame().unwrap().to_vec(), vec![4; 10]);
        assert_eq!(rxq.rx_cur, 4);
    }

    #[test]
    fn full_frame_queue_applies_backpressure() {
        let mut rxq = rx_queue(8, 2, Arc::new(HeapDma));
        for idx in 0..3 {
            device_receive(&mut rxq, idx, &[idx as u8; 64], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        }
        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(2));
        assert_eq!(rxq.rx_cur, 2);
        assert!(rxq.rx_descs[2].descriptor_done());
        assert_eq!(rxq.regs.tails, vec![0, 1]);

        // consuming a frame makes room for the one left behind
        drop(rxq.return_frame());
        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        assert_eq!(rxq.rx_cur, 3);
    }

    #[test]
    fn consumed_frames_return_buffers_to_pool() {
        let mut rxq = rx_queue(4, 4, Arc::new(HeapDma));
        device_receive(&mut rxq, 0, &[9; 64], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        rxq.poll_queue_and_store_received_packets().unwrap();
        let pooled = rxq.rx_buffer_pool.len();
        drop(rxq.return_frame());
        assert_eq!(rxq.rx_buffer_pool.len(), pooled + 1);
    }

    #[test]
    fn missing_replacement_buffer_stops_consumption() {
        let mut rxq = rx_queue(4, 4, Arc::new(LimitedDma { remaining: AtomicU32::new(0) }));
        device_receive(&mut rxq, 0, &[9; 64], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        assert_eq!(
            rxq.poll_queue_and_store_received_packets(),
            Err(NicQueueError::ReceiveBufferUnavailable { index: 0 })
        );
        assert_eq!(rxq.rx_cur, 0);
        assert!(rxq.rx_descs[0].descriptor_done());
        assert!(rxq.regs.tails.is_empty());
    }

    #[test]
    fn exhausted_pool_stalls_the_ring_until_frames_are_consumed() {
        let mut rxq = rx_queue_with_pool(4, 8, 6, Arc::new(HeapDma));
        for idx in 0..3 {
            device_receive(&mut rxq, idx, &[idx as u8; 64], RxStatus::DD | RxStatus::EOP, RxErrors::empty());
        }
        // two spare buffers, so the third descriptor can't be re-armed
        assert_eq!(
            rxq.poll_queue_and_store_received_packets(),
            Err(NicQueueError::ReceiveBufferUnavailable { index: 2 })
        );
        assert_eq!(rxq.received_frames.len(), 2);
        assert_eq!(rxq.rx_buffer_pool.in_circulation(), 6);
        assert!(rxq.rx_descs[2].descriptor_done());

        drop(rxq.return_frame());
        assert_eq!(rxq.poll_queue_and_store_received_packets(), Ok(1));
        assert_eq!(rxq.rx_cur, 3);
        assert_eq!(rxq.rx_buffer_pool.in_circulation(), 6);
    }

    #[test]
    fn send_programs_descriptor_and_advances_tail() {
        let mut txq = tx_queue(4);
        let pool = Arc::new(BufferPool::new(8, 2048));
        let tx_buf = pooled_tx_buffer(&pool, 60);
        let paddr = tx_buf.phys_addr().as_u64();

        assert_eq!(txq.send_on_queue(tx_buf).ok(), Some(0));
        assert_eq!(txq.tx_descs[0].packet_address(), paddr);
        assert_eq!(txq.tx_descs[0].length.read(), 60);
        assert_eq!(txq.tx_descs[0].command(), TxCommand::EOP | TxCommand::IFCS | TxCommand::RS);
        assert_eq!(txq.regs.tails, vec![1]);
        assert_eq!(txq.in_flight(), 1);
    }

    #[test]
    fn full_ring_reports_queue_full_until_reclaimed() {
        let mut txq = tx_queue(4);
        let pool = Arc::new(BufferPool::new(8, 2048));
        for expected in 0..3 {
            assert_eq!(txq.send_on_queue(pooled_tx_buffer(&pool, 64)).ok(), Some(expected));
        }
        let mut rejected = pooled_tx_buffer(&pool, 64);
        rejected.copy_from_slice(&[0x5A; 64]);
        let paddr = rejected.phys_addr();
        let (err, rejected) = txq.send_on_queue(rejected).unwrap_err();
        assert_eq!(err, NicQueueError::QueueFull);
        assert_eq!(txq.regs.tails, vec![1, 2, 3]);
        // the caller still holds the filled buffer
        assert_eq!(rejected.phys_addr(), paddr);
        assert!(rejected.iter().all(|&b| b == 0x5A));
        assert!(pool.is_empty());

        device_transmitted(&mut txq, 0);
        assert_eq!(txq.send_on_queue(rejected).ok(), Some(3));
        assert_eq!(txq.tx_descs[3].packet_address(), paddr.as_u64());
        assert_eq!(txq.tx_clean, 1);
        assert_eq!(txq.regs.tails, vec![1, 2, 3, 0]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn reclaim_stops_at_first_unfinished_descriptor() {
        let mut txq = tx_queue(8);
        let pool = Arc::new(BufferPool::new(8, 2048));
        for _ in 0..3 {
            assert!(txq.send_on_queue(pooled_tx_buffer(&pool, 64)).is_ok());
        }
        device_transmitted(&mut txq, 0);
        device_transmitted(&mut txq, 2);
        assert_eq!(txq.reclaim_completed(), 1);
        assert_eq!(txq.in_flight(), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn completion_wait_is_bounded() {
        let mut txq = tx_queue(4);
        let pool = Arc::new(BufferPool::new(8, 2048));
        let idx = txq.send_on_queue(pooled_tx_buffer(&pool, 64)).ok().unwrap();
        assert_eq!(
            txq.wait_for_tx_completion(idx),
            Err(NicQueueError::TxCompletionTimeout { index: 0, attempts: 5 })
        );
        device_transmitted(&mut txq, usize::from(idx));
        assert_eq!(txq.wait_for_tx_completion(idx), Ok(()));
        assert_eq!(txq.wait_for_tx_completion(9), Err(NicQueueError::InvalidIndex(9)));
    }

    #[test]
    fn empty_packet_is_rejected_without_touching_the_ring() {
        let mut txq = tx_queue(4);
        let pool = Arc::new(BufferPool::new(8, 2048));
        let (err, rejected) = txq.send_on_queue(pooled_tx_buffer(&pool, 0)).unwrap_err();
        assert_eq!(err, NicQueueError::EmptyPacket);
        assert!(txq.regs.tails.is_empty());
        assert_eq!(txq.tx_cur, 0);
        drop(rejected);
        assert_eq!(pool.len(), 1);
    }
}
