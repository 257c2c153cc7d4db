//! Bootstrap Frame Supplier
//!
//! - Hands out zeroed, frame-aligned physical frames before the general
//!   allocator is trusted with page-table memory
//! - Reuses given-back frames through a free list threaded through the
//!   frames themselves, then carves new ones from a bounded pool cursor
//! - Serves the address-translation manager only; general kernel code
//!   allocates through the bitmap allocator

use core::ptr;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::{BOOT_POOL_SIZE, BOOT_POOL_START, FRAME_SIZE};

/// Link node living in the first word of a frame on the free list.
#[repr(C)]
struct FreeFrame {
    next: *mut FreeFrame,
}

/// Allocation-only frame supplier over a fixed physical pool.
///
/// * `free_list_head`: most recently given-back frame, `null` when empty
/// * `next_frame`: cursor into the untouched part of the pool
/// * `pool_end`: first address past the pool; the cursor never crosses it
pub struct BootFrameAllocator {
    free_list_head: *mut FreeFrame,
    next_frame: u64,
    pool_end: u64,
    taken: usize,
    returned: usize,
}

impl BootFrameAllocator {
    /// Supplier over the configured boot pool.
    ///
    /// # Safety
    /// The boot pool must be identity-accessible and not in use by anything
    /// else; only one supplier may exist over it.
    pub unsafe fn new() -> Self {
        Self::with_pool(BOOT_POOL_START, BOOT_POOL_START + BOOT_POOL_SIZE)
    }

    /// Supplier over an explicit physical range.
    ///
    /// # Safety
    /// `[pool_start, pool_end)` must be frame-aligned, identity-accessible
    /// memory exclusively owned by the returned supplier.
    pub unsafe fn with_pool(pool_start: u64, pool_end: u64) -> Self {
        BootFrameAllocator {
            free_list_head: ptr::null_mut(),
            next_frame: pool_start,
            pool_end,
            taken: 0,
            returned: 0,
        }
    }

    /// Pops a previously given-back frame, or carves a new one from the
    /// cursor. Either way the frame comes back zeroed. `None` once the
    /// free list is empty and the pool is exhausted.
    pub fn take_frame(&mut self) -> Option<PhysAddr> {
        let addr = if self.free_list_head.is_null() {
            if self.next_frame >= self.pool_end {
                return None;
            }
            let addr = self.next_frame;
            self.next_frame += FRAME_SIZE as u64;
            addr
        } else {
            let frame = self.free_list_head;
            self.free_list_head = unsafe { (*frame).next };
            frame as u64
        };

        unsafe { ptr::write_bytes(addr as *mut u8, 0, FRAME_SIZE) };
        self.taken += 1;
        Some(PhysAddr::new(addr))
    }

    /// Pushes a frame back onto the free list. A misaligned address is
    /// dropped with a warning instead of corrupting the list.
    pub fn give_frame(&mut self, addr: PhysAddr) {
        if !addr.is_aligned(FRAME_SIZE as u64) {
            log::warn!(
                "dropping non-aligned frame {:#x} given back to boot pool",
                addr.as_u64()
            );
            return;
        }

        let frame = addr.as_u64() as *mut FreeFrame;
        unsafe { (*frame).next = self.free_list_head };
        self.free_list_head = frame;
        self.returned += 1;
    }

    /// Frames handed out and given back over the supplier's lifetime.
    pub fn usage(&self) -> (usize, usize) {
        (self.taken, self.returned)
    }

    /// Length of the free list. The walk is bounded so a corrupted list
    /// reports its cap instead of looping forever.
    pub fn free_list_len(&self) -> usize {
        const WALK_LIMIT: usize = 10_000;

        let mut count = 0;
        let mut current = self.free_list_head;
        while !current.is_null() && count < WALK_LIMIT {
            count += 1;
            current = unsafe { (*current).next };
        }
        count
    }

    /// Logs the supplier's lifetime tallies.
    pub fn log_usage(&self) {
        log::info!("boot frame pool:");
        log::info!("  frames taken: {}", self.taken);
        log::info!("  frames given back: {}", self.returned);
        log::info!("  frames on free list: {}", self.free_list_len());
    }
}

// The free list is threaded through exclusively-owned, identity-mapped
// physical frames on a single core; the supplier is never shared across
// threads except behind the `KERNEL_SPACE` mutex.
unsafe impl Send for BootFrameAllocator {}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.take_frame()
            .map(|addr| PhysFrame::containing_address(addr))
    }
}

impl FrameDeallocator<Size4KiB> for BootFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.give_frame(frame.start_address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, Layout};

    /// Carves a frame-aligned pool out of the kernel heap. Leaked on
    /// purpose; test frames stay valid for the rest of the run.
    fn test_pool(frames: usize) -> u64 {
        let layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        unsafe { alloc(layout) as u64 }
    }

    #[test_case]
    fn taken_frames_are_aligned_and_zeroed() {
        let pool = test_pool(2);
        let mut supplier =
            unsafe { BootFrameAllocator::with_pool(pool, pool + (2 * FRAME_SIZE) as u64) };

        unsafe { ptr::write_bytes(pool as *mut u8, 0xAB, 2 * FRAME_SIZE) };

        let frame = supplier.take_frame().expect("pool has frames");
        assert!(frame.is_aligned(FRAME_SIZE as u64));

        let bytes =
            unsafe { core::slice::from_raw_parts(frame.as_u64() as *const u8, FRAME_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test_case]
    fn given_back_frames_are_reused_first() {
        let pool = test_pool(4);
        let mut supplier =
            unsafe { BootFrameAllocator::with_pool(pool, pool + (4 * FRAME_SIZE) as u64) };

        let first = supplier.take_frame().unwrap();
        let _second = supplier.take_frame().unwrap();

        supplier.give_frame(first);
        let reused = supplier.take_frame().unwrap();
        assert_eq!(reused, first);
    }

    #[test_case]
    fn misaligned_give_back_is_dropped() {
        let pool = test_pool(2);
        let mut supplier =
            unsafe { BootFrameAllocator::with_pool(pool, pool + (2 * FRAME_SIZE) as u64) };

        let frame = supplier.take_frame().unwrap();
        supplier.give_frame(frame + 1u64);
        assert_eq!(supplier.free_list_len(), 0);

        supplier.give_frame(frame);
        assert_eq!(supplier.free_list_len(), 1);
    }

    #[test_case]
    fn exhausted_pool_returns_none() {
        let pool = test_pool(2);
        let mut supplier =
            unsafe { BootFrameAllocator::with_pool(pool, pool + (2 * FRAME_SIZE) as u64) };

        assert!(supplier.take_frame().is_some());
        assert!(supplier.take_frame().is_some());
        assert!(supplier.take_frame().is_none());

        // A give-back refills the supplier even with the cursor spent.
        supplier.give_frame(PhysAddr::new(pool));
        assert!(supplier.take_frame().is_some());
    }
}
