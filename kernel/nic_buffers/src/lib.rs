//! Defines buffers that are used to send and receive packets,
//! and the physically-contiguous memory that backs them and the descriptor rings.
//!
//! All DMA memory comes from a [`DmaAllocator`], the one place where a
//! [`VirtualAddress`] and its matching [`PhysicalAddress`] are produced together.
//! DMA memory is never handed back to the allocator;
//! instead, buffers circulate through a [`BufferPool`] that caps how many of them exist.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use core::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use memory_structs::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use spin::Mutex;

/// Descriptor rings must start on a 128-byte boundary.
pub const DESCRIPTOR_RING_ALIGNMENT: usize = 128;

/// A source of memory that a device can access via DMA.
pub trait DmaAllocator: Send + Sync {
    /// Allocates a physically-contiguous, zeroed region of at least `size_in_bytes` bytes.
    ///
    /// The region must start on a page boundary and remain valid for the lifetime of the system.
    fn allocate_dma(&self, size_in_bytes: usize) -> Result<DmaBuffer, &'static str>;
}

/// A region of physically-contiguous memory that a device can access via DMA.
///
/// Holds both the address the CPU uses and the address the device uses.
/// The two are only ever paired up by a [`DmaAllocator`].
pub struct DmaBuffer {
    start: VirtualAddress,
    phys_addr: PhysicalAddress,
    size_in_bytes: usize,
}

// The memory behind a `DmaBuffer` is exclusively owned by it.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Creates a `DmaBuffer` that describes an existing DMA region.
    ///
    /// # Safety
    /// `start` must point to `size_in_bytes` bytes of writable memory that are
    /// physically contiguous beginning at `phys_addr`, and that memory must not be
    /// accessible through any other `DmaBuffer`.
    pub unsafe fn from_raw_parts(start: VirtualAddress, phys_addr: PhysicalAddress, size_in_bytes: usize) -> DmaBuffer {
        DmaBuffer { start, phys_addr, size_in_bytes }
    }

    /// Returns a `DmaBuffer` that covers no memory at all.
    pub const fn empty() -> DmaBuffer {
        DmaBuffer {
            start: VirtualAddress::zero(),
            phys_addr: PhysicalAddress::zero(),
            size_in_bytes: 0,
        }
    }

    pub fn start_address(&self) -> VirtualAddress {
        self.start
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Returns a byte slice of `length` bytes starting at `byte_offset` into this buffer.
    pub fn as_slice(&self, byte_offset: usize, length: usize) -> Result<&[u8], &'static str> {
        let ptr = self.checked_ptr(byte_offset, length)?;
        Ok(unsafe { slice::from_raw_parts(ptr.as_ptr(), length) })
    }

    /// Returns a mutable byte slice of `length` bytes starting at `byte_offset` into this buffer.
    pub fn as_slice_mut(&mut self, byte_offset: usize, length: usize) -> Result<&mut [u8], &'static str> {
        let ptr = self.checked_ptr(byte_offset, length)?;
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), length) })
    }

    fn checked_ptr(&self, byte_offset: usize, length: usize) -> Result<NonNull<u8>, &'static str> {
        let end = byte_offset.checked_add(length).ok_or("DmaBuffer: slice end overflowed")?;
        if end > self.size_in_bytes {
            return Err("DmaBuffer: requested slice extends beyond the end of the buffer");
        }
        if length == 0 {
            return Ok(NonNull::dangling());
        }
        NonNull::new((self.start + byte_offset).as_mut_ptr::<u8>())
            .ok_or("DmaBuffer: buffer has a null start address")
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "DmaBuffer {{ start: {:?}, phys_addr: {:?}, size: {} }}", self.start, self.phys_addr, self.size_in_bytes)
    }
}

/// A fixed-length array of hardware descriptors of type `T` living in DMA memory.
///
/// Derefs into a slice of descriptors.
/// The device finds the ring through [`DescriptorRing::phys_addr()`].
pub struct DescriptorRing<T> {
    memory: DmaBuffer,
    num_descs: usize,
    _descriptor: PhantomData<T>,
}

impl<T> DescriptorRing<T> {
    /// Interprets the beginning of `memory` as an array of `num_descs` descriptors.
    ///
    /// # Safety
    /// An all-zero byte pattern must be a valid `T`, `T` must not own any resources,
    /// and `memory` must be zeroed or hold `num_descs` valid `T`s.
    pub unsafe fn new(memory: DmaBuffer, num_descs: usize) -> Result<DescriptorRing<T>, &'static str> {
        let size_in_bytes = num_descs.checked_mul(size_of::<T>())
            .ok_or("DescriptorRing: ring size overflowed")?;
        if num_descs == 0 {
            return Err("DescriptorRing: a ring needs at least one descriptor");
        }
        if size_in_bytes > memory.size_in_bytes() {
            return Err("DescriptorRing: DMA memory is too small for the requested number of descriptors");
        }
        if memory.start_address().value() % align_of::<T>() != 0 {
            return Err("DescriptorRing: DMA memory is misaligned for the descriptor type");
        }
        if memory.phys_addr().value() % DESCRIPTOR_RING_ALIGNMENT != 0 {
            return Err("DescriptorRing: physical address of the ring isn't 128-byte aligned");
        }
        Ok(DescriptorRing { memory, num_descs, _descriptor: PhantomData })
    }

    /// The physical address of the first descriptor, as programmed into the device.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.memory.phys_addr()
    }

    /// The size of the whole ring in bytes, as programmed into the device.
    pub fn size_in_bytes(&self) -> usize {
        self.num_descs * size_of::<T>()
    }
}

impl<T> Deref for DescriptorRing<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // The length and alignment were checked in `new()`.
        unsafe { slice::from_raw_parts(self.memory.start_address().as_mut_ptr::<T>() as *const T, self.num_descs) }
    }
}

impl<T> DerefMut for DescriptorRing<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.memory.start_address().as_mut_ptr::<T>(), self.num_descs) }
    }
}

/// A bounded pool of equally-sized DMA buffers.
///
/// The pool never has more than `capacity` buffers in circulation,
/// counting both the ones it holds and the ones handed out.
/// A buffer dropped back into the pool therefore always finds a free slot.
pub struct BufferPool {
    state: Mutex<PoolState>,
    capacity: usize,
    buffer_size: usize,
}

struct PoolState {
    free: VecDeque<DmaBuffer>,
    /// Buffers that belong to this pool, whether free or in use.
    in_circulation: usize,
}

impl BufferPool {
    /// Creates an empty pool that circulates at most `capacity` buffers of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize) -> BufferPool {
        BufferPool {
            state: Mutex::new(PoolState {
                free: VecDeque::with_capacity(capacity),
                in_circulation: 0,
            }),
            capacity,
            buffer_size,
        }
    }

    /// Adds a buffer from outside the pool to its circulation.
    ///
    /// If the pool already circulates `capacity` buffers or the buffer is too small,
    /// it is returned in the `Err`.
    pub fn push(&self, buffer: DmaBuffer) -> Result<(), DmaBuffer> {
        if buffer.size_in_bytes() < self.buffer_size {
            return Err(buffer);
        }
        let mut state = self.state.lock();
        if state.in_circulation >= self.capacity {
            return Err(buffer);
        }
        state.in_circulation += 1;
        state.free.push_back(buffer);
        Ok(())
    }

    /// Puts back a buffer that was handed out by this pool.
    fn recycle(&self, buffer: DmaBuffer) -> Result<(), DmaBuffer> {
        let mut state = self.state.lock();
        if buffer.size_in_bytes() < self.buffer_size || state.free.len() >= state.in_circulation {
            return Err(buffer);
        }
        state.free.push_back(buffer);
        Ok(())
    }

    pub fn pop(&self) -> Option<DmaBuffer> {
        self.state.lock().free.pop_front()
    }

    /// Takes a buffer from the pool, or allocates a fresh one if the pool is empty
    /// and fewer than `capacity` buffers are in circulation.
    pub fn pop_or_allocate(&self, allocator: &dyn DmaAllocator) -> Result<DmaBuffer, &'static str> {
        {
            let mut state = self.state.lock();
            if let Some(buffer) = state.free.pop_front() {
                return Ok(buffer);
            }
            if state.in_circulation >= self.capacity {
                return Err("buffer pool exhausted, every buffer is in use");
            }
            state.in_circulation += 1;
        }
        allocator.allocate_dma(self.buffer_size).map_err(|e| {
            self.state.lock().in_circulation -= 1;
            e
        })
    }

    /// Allocates buffers until the pool holds `count` of them (or circulates `capacity` buffers).
    pub fn fill(&self, count: usize, allocator: &dyn DmaAllocator) -> Result<(), &'static str> {
        while self.len() < count.min(self.capacity) {
            if self.in_circulation() >= self.capacity {
                error!("BufferPool::fill(): only {} of {} buffers are free, the rest are in use", self.len(), count);
                return Err("buffer pool exhausted, every buffer is in use");
            }
            let buffer = allocator.allocate_dma(self.buffer_size)?;
            if self.push(buffer).is_err() {
                error!("BufferPool::fill(): pool rejected a freshly allocated buffer");
                return Err("buffer pool is full");
            }
        }
        Ok(())
    }

    /// The number of free buffers held by the pool.
    pub fn len(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of buffers that belong to this pool, whether free or in use.
    pub fn in_circulation(&self) -> usize {
        self.state.lock().in_circulation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The size in bytes of every buffer in this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Returns the DMA memory of a dropped buffer to `pool`.
fn return_to_pool(pool: &BufferPool, buffer: DmaBuffer) {
    if buffer.size_in_bytes() == 0 {
        return;
    }
    if let Err(_buf) = pool.recycle(buffer) {
        error!("NIC: couldn't return dropped buffer to pool, phys_addr: {:#X}", _buf.phys_addr());
    }
}

/// A buffer that stores a packet to be transmitted through the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice that represents its underlying memory.
/// If it came from a pool, it goes back there when dropped.
pub struct TransmitBuffer {
    buffer: DmaBuffer,
    length: u16,
    pool: Option<Arc<BufferPool>>,
}

impl TransmitBuffer {
    /// Wraps `buffer` so that the first `length` bytes of it will be transmitted.
    pub fn new(buffer: DmaBuffer, length: u16) -> Result<TransmitBuffer, &'static str> {
        if usize::from(length) > buffer.size_in_bytes() {
            return Err("TransmitBuffer::new(): DMA buffer too small");
        }
        Ok(TransmitBuffer { buffer, length, pool: None })
    }

    /// Takes a buffer from `pool` (allocating one if needed) that will return to `pool` once dropped.
    pub fn from_pool(pool: &Arc<BufferPool>, allocator: &dyn DmaAllocator, length: u16) -> Result<TransmitBuffer, &'static str> {
        if usize::from(length) > pool.buffer_size() {
            return Err("TransmitBuffer::from_pool(): packet larger than the pool's buffer size");
        }
        let buffer = pool.pop_or_allocate(allocator)?;
        let mut tx_buf = TransmitBuffer::new(buffer, length)?;
        tx_buf.pool = Some(Arc::clone(pool));
        Ok(tx_buf)
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.buffer.phys_addr()
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the current length.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.length {
            Err("TransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // `length` was checked against the buffer size on creation and can only shrink.
        self.buffer.as_slice(0, usize::from(self.length)).unwrap_or(&[])
    }
}

impl DerefMut for TransmitBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let length = usize::from(self.length);
        self.buffer.as_slice_mut(0, length).unwrap_or(&mut [])
    }
}

impl Drop for TransmitBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buffer = core::mem::replace(&mut self.buffer, DmaBuffer::empty());
            return_to_pool(&pool, buffer);
        }
    }
}

/// A buffer that stores a packet (a piece of an Ethernet frame) that has been received from the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice that represents its underlying memory.
/// When dropped, its underlying memory is automatically returned to its pool for future reuse.
pub struct ReceiveBuffer {
    buffer: DmaBuffer,
    length: u16,
    pool: Arc<BufferPool>,
}

impl ReceiveBuffer {
    /// Creates a new ReceiveBuffer with the given DMA memory and `length`.
    /// When this ReceiveBuffer object is dropped, its memory will be returned to the given `pool`.
    pub fn new(buffer: DmaBuffer, length: u16, pool: Arc<BufferPool>) -> Result<ReceiveBuffer, &'static str> {
        if usize::from(length) > buffer.size_in_bytes() {
            Err("ReceiveBuffer::new(): DMA buffer too small")
        } else {
            Ok(ReceiveBuffer { buffer, length, pool })
        }
    }

    /// Takes a buffer from `pool` (allocating one if needed) that spans the pool's full buffer size.
    pub fn from_pool(pool: &Arc<BufferPool>, allocator: &dyn DmaAllocator) -> Result<ReceiveBuffer, &'static str> {
        let length = u16::try_from(pool.buffer_size())
            .map_err(|_| "ReceiveBuffer::from_pool(): pool buffer size exceeds u16::MAX")?;
        let buffer = pool.pop_or_allocate(allocator)?;
        ReceiveBuffer::new(buffer, length, Arc::clone(pool))
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.buffer.phys_addr()
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// The number of bytes the underlying DMA memory can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.size_in_bytes()
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the current length.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.length {
            Err("ReceiveBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_slice(0, usize::from(self.length)).unwrap_or(&[])
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let length = usize::from(self.length);
        self.buffer.as_slice_mut(0, length).unwrap_or(&mut [])
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        // Swap in an empty buffer so we can take ownership of the real one.
        let buffer = core::mem::replace(&mut self.buffer, DmaBuffer::empty());
        return_to_pool(&self.pool, buffer);
    }
}

/// A network (e.g., Ethernet) frame that has been received by the NIC.
/// A single frame can span multiple receive buffers.
pub struct ReceivedFrame(pub Vec<ReceiveBuffer>);

impl ReceivedFrame {
    /// The total number of bytes in this frame, across all of its buffers.
    pub fn total_length(&self) -> usize {
        self.0.iter().map(|buf| usize::from(buf.length())).sum()
    }

    /// Copies the contents of this frame into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_length());
        for buf in &self.0 {
            bytes.extend_from_slice(buf);
        }
        bytes
    }
}

/// Rounds `size_in_bytes` up to a whole number of pages.
pub fn page_align_up(size_in_bytes: usize) -> usize {
    size_in_bytes.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE
}
