//! Bitmap physical-frame allocator.
//!
//! One bit per frame over the managed region, 1 = allocated. The bitmap
//! population is the single source of truth: free and used counts are
//! derived from it on demand and can never drift from the bits. Search is
//! next-fit, resuming from the cursor left by the previous allocation and
//! wrapping around the region once.

use core::{fmt, mem, ptr, slice};

use arrayvec::ArrayVec;
use spin::Mutex;
use x86_64::{
    align_up,
    instructions::interrupts::without_interrupts,
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::error::MemoryError;
use crate::constants::memory::{
    BITMAP_ENTRY_BITS, BOOT_POOL_SIZE, BOOT_POOL_START, FRAME_SIZE, HEAP_BASE, HEAP_SIZE,
    KERNEL_END, KERNEL_START, MANAGED_SIZE, MANAGED_START, MAX_REGIONS, PAGE_SIZE,
};

/// Global frame allocator; `None` until [`init`] has run.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Reserved,
    Available,
    Kernel,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Reserved => write!(f, "Reserved"),
            RegionKind::Available => write!(f, "Available"),
            RegionKind::Kernel => write!(f, "Kernel"),
        }
    }
}

/// Region descriptor, recorded once at initialization for reporting.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: u64,
    pub size: u64,
    pub kind: RegionKind,
}

/// Point-in-time view of the allocator, derived from the bitmap.
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
    pub bitmap_bytes: usize,
    pub last_allocated: usize,
}

pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    region_start: u64,
    total_frames: usize,
    next_fit: usize,
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl BitmapFrameAllocator {
    /// Builds an allocator over `[region_start, region_start + region_size)`
    /// with the bitmap in the given storage. Descriptors are recorded as
    /// passed; frames overlapping a non-available descriptor start out
    /// allocated.
    ///
    /// # Safety
    /// `bitmap_storage` must point to enough exclusively-owned, writable
    /// memory for one bit per frame, and the managed region must be
    /// identity-accessible memory nothing else allocates from.
    pub unsafe fn new(
        bitmap_storage: *mut u64,
        region_start: u64,
        region_size: u64,
        regions: &[Region],
    ) -> Self {
        let total_frames = (region_size as usize).div_ceil(FRAME_SIZE);
        let entries = total_frames.div_ceil(BITMAP_ENTRY_BITS);

        let bitmap = slice::from_raw_parts_mut(bitmap_storage, entries);
        bitmap.fill(0);

        // Bits past the declared frame count stay set so out-of-range
        // queries read as allocated.
        let tail = total_frames % BITMAP_ENTRY_BITS;
        if tail != 0 {
            bitmap[entries - 1] = !0u64 << tail;
        }

        let mut allocator = BitmapFrameAllocator {
            bitmap,
            region_start,
            total_frames,
            next_fit: 0,
            regions: ArrayVec::new(),
        };

        for region in regions {
            if allocator.regions.try_push(*region).is_err() {
                log::warn!(
                    "region table full, dropping {:#x}+{:#x} from the memory map",
                    region.start,
                    region.size
                );
                continue;
            }
            if region.kind != RegionKind::Available {
                allocator.mark_range(region.start, region.size, true);
            }
        }

        allocator
    }

    /// Allocates `count` contiguous frames, zero-filled. `None` when
    /// `count` is zero or no run of that length exists; a failed search
    /// changes nothing.
    pub fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || self.free_frame_count() < count {
            return None;
        }

        let start = self.find_free_run(count)?;
        for index in start..start + count {
            self.set_bit(index);
        }
        self.next_fit = (start + count) % self.total_frames;

        let addr = self.region_start + (start * FRAME_SIZE) as u64;
        unsafe { ptr::write_bytes(addr as *mut u8, 0, count * FRAME_SIZE) };
        Some(PhysAddr::new(addr))
    }

    /// Next-fit search for `count` adjacent free frames. The run resets at
    /// the wrap point: frame indices across the boundary are not adjacent
    /// in physical memory.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        let mut run_start = 0;

        for i in 0..self.total_frames {
            let index = (self.next_fit + i) % self.total_frames;
            if index == 0 {
                run = 0;
            }
            if self.is_bit_set(index) {
                run = 0;
                continue;
            }
            if run == 0 {
                run_start = index;
            }
            run += 1;
            if run == count {
                return Some(run_start);
            }
        }
        None
    }

    /// Releases `count` frames starting at `addr`. The address must be
    /// frame-aligned and the whole run must lie inside the managed region.
    /// Clearing an already-free frame warns but is not an error.
    pub fn free_frames(&mut self, addr: PhysAddr, count: usize) -> Result<(), MemoryError> {
        if count == 0 || !addr.is_aligned(FRAME_SIZE as u64) {
            return Err(MemoryError::InvalidArgument);
        }
        let offset = addr
            .as_u64()
            .checked_sub(self.region_start)
            .ok_or(MemoryError::InvalidArgument)?;
        let start = (offset / FRAME_SIZE as u64) as usize;
        if start + count > self.total_frames {
            return Err(MemoryError::InvalidArgument);
        }

        for index in start..start + count {
            if !self.is_bit_set(index) {
                log::warn!(
                    "freeing already-free frame at {:#x}",
                    self.region_start + (index * FRAME_SIZE) as u64
                );
            }
            self.clear_bit(index);
        }
        Ok(())
    }

    /// Marks every frame overlapping `[start, start + size)` allocated.
    /// Idempotent; ranges outside the managed region are ignored.
    pub fn reserve_region(&mut self, start: u64, size: u64) {
        self.mark_range(start, size, true);
    }

    /// Marks every frame overlapping `[start, start + size)` free.
    /// Idempotent; ranges outside the managed region are ignored.
    pub fn mark_available(&mut self, start: u64, size: u64) {
        self.mark_range(start, size, false);
    }

    fn mark_range(&mut self, start: u64, size: u64, allocated: bool) {
        if start < self.region_start {
            return;
        }
        let first = ((start - self.region_start) / FRAME_SIZE as u64) as usize;
        let count = (size as usize).div_ceil(FRAME_SIZE);
        for index in first..(first + count).min(self.total_frames) {
            if allocated {
                self.set_bit(index);
            } else {
                self.clear_bit(index);
            }
        }
    }

    /// True when the frame holding `addr` is allocated. Addresses outside
    /// the managed region read as allocated.
    pub fn is_allocated(&self, addr: PhysAddr) -> bool {
        let addr = addr.as_u64();
        let region_end = self.region_start + (self.total_frames * FRAME_SIZE) as u64;
        if addr < self.region_start || addr >= region_end {
            return true;
        }
        self.is_bit_set(((addr - self.region_start) / FRAME_SIZE as u64) as usize)
    }

    /// Free frames, by bitmap population count.
    pub fn free_frame_count(&self) -> usize {
        // Tail bits past the frame count are always set, so zero bits
        // count exactly the free frames.
        self.bitmap
            .iter()
            .map(|entry| entry.count_zeros() as usize)
            .sum()
    }

    pub fn used_frame_count(&self) -> usize {
        self.total_frames - self.free_frame_count()
    }

    pub fn stats(&self) -> PmmStats {
        let free_frames = self.free_frame_count();
        PmmStats {
            total_frames: self.total_frames,
            free_frames,
            used_frames: self.total_frames - free_frames,
            bitmap_bytes: self.bitmap.len() * mem::size_of::<u64>(),
            last_allocated: self.next_fit,
        }
    }

    /// Emits the statistics report.
    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!("frame allocator statistics:");
        log::info!(
            "  total frames: {} ({} KiB)",
            stats.total_frames,
            stats.total_frames * FRAME_SIZE / 1024
        );
        log::info!(
            "  free frames: {} ({} KiB)",
            stats.free_frames,
            stats.free_frames * FRAME_SIZE / 1024
        );
        log::info!(
            "  used frames: {} ({} KiB)",
            stats.used_frames,
            stats.used_frames * FRAME_SIZE / 1024
        );
        log::info!("  bitmap size: {} bytes", stats.bitmap_bytes);
        log::info!("  allocation cursor: frame {}", stats.last_allocated);
        log::info!(
            "  utilization: {}%",
            stats.used_frames * 100 / stats.total_frames
        );
    }

    /// Emits the memory-map report, one line per recorded region.
    pub fn log_memory_map(&self) {
        log::info!("physical memory map:");
        for region in &self.regions {
            log::info!(
                "  {:#010x} - {:#010x} ({} KiB) {}",
                region.start,
                region.start + region.size - 1,
                region.size / 1024,
                region.kind
            );
        }
    }

    /// Debug dump of a bitmap window, 'X' allocated, '.' free.
    pub fn dump_bitmap(&self, start_frame: usize, count: usize) {
        use alloc::string::String;

        let end = (start_frame + count).min(self.total_frames);
        log::debug!("bitmap dump (frames {}-{}):", start_frame, end.max(1) - 1);

        let mut index = start_frame;
        while index < end {
            let row_end = (index + 32).min(end);
            let mut row = String::new();
            for frame in index..row_end {
                row.push(if self.is_bit_set(frame) { 'X' } else { '.' });
            }
            log::debug!("  {:04}: {}", index, row);
            index = row_end;
        }
    }

    fn set_bit(&mut self, index: usize) {
        if index >= self.total_frames {
            return;
        }
        self.bitmap[index / BITMAP_ENTRY_BITS] |= 1 << (index % BITMAP_ENTRY_BITS);
    }

    fn clear_bit(&mut self, index: usize) {
        if index >= self.total_frames {
            return;
        }
        self.bitmap[index / BITMAP_ENTRY_BITS] &= !(1 << (index % BITMAP_ENTRY_BITS));
    }

    /// Out-of-range indices read as allocated.
    fn is_bit_set(&self, index: usize) -> bool {
        if index >= self.total_frames {
            return true;
        }
        self.bitmap[index / BITMAP_ENTRY_BITS] & (1 << (index % BITMAP_ENTRY_BITS)) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_frames(1)
            .map(|addr| PhysFrame::containing_address(addr))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Err(err) = self.free_frames(frame.start_address(), 1) {
            log::warn!("deallocate_frame: {}", err);
        }
    }
}

/// One-time initialization over the configured managed region. The bitmap
/// lives in the first frames of the region and reserves itself there. A
/// second call is a no-op.
pub fn init() {
    without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        if guard.is_some() {
            return;
        }

        let total_frames = (MANAGED_SIZE as usize).div_ceil(FRAME_SIZE);
        let bitmap_bytes = total_frames.div_ceil(BITMAP_ENTRY_BITS) * mem::size_of::<u64>();
        let available_start = align_up(MANAGED_START + bitmap_bytes as u64, PAGE_SIZE);

        let regions = [
            Region {
                start: KERNEL_START,
                size: KERNEL_END - KERNEL_START,
                kind: RegionKind::Kernel,
            },
            Region {
                start: HEAP_BASE,
                size: HEAP_SIZE as u64,
                kind: RegionKind::Reserved,
            },
            Region {
                start: BOOT_POOL_START,
                size: BOOT_POOL_SIZE,
                kind: RegionKind::Reserved,
            },
            Region {
                start: MANAGED_START,
                size: bitmap_bytes as u64,
                kind: RegionKind::Reserved,
            },
            Region {
                start: available_start,
                size: MANAGED_START + MANAGED_SIZE - available_start,
                kind: RegionKind::Available,
            },
        ];

        *guard = Some(unsafe {
            BitmapFrameAllocator::new(
                MANAGED_START as *mut u64,
                MANAGED_START,
                MANAGED_SIZE,
                &regions,
            )
        });
    });
}

/// Runs `f` on the global allocator with interrupts masked for the
/// duration. Panics when [`init`] has not run.
pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        let allocator = guard.as_mut().expect("frame allocator not initialized");
        f(allocator)
    })
}

/// Allocates a single frame from the global allocator. `None` before
/// initialization or when no frame is free.
pub fn alloc_frame() -> Option<PhysFrame> {
    without_interrupts(|| {
        FRAME_ALLOCATOR
            .lock()
            .as_mut()
            .and_then(|allocator| allocator.allocate_frame())
    })
}

/// Returns a single frame to the global allocator.
pub fn dealloc_frame(frame: PhysFrame) {
    with_frame_allocator(|allocator| unsafe { allocator.deallocate_frame(frame) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, Layout};

    /// Heap-backed region plus external bitmap storage, both leaked so
    /// frames outlive the test.
    fn test_storage(frames: usize) -> (u64, *mut u64) {
        let region_layout = Layout::from_size_align(frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        let bitmap_entries = frames.div_ceil(BITMAP_ENTRY_BITS);
        let bitmap_layout =
            Layout::from_size_align(bitmap_entries * mem::size_of::<u64>(), mem::align_of::<u64>())
                .unwrap();
        unsafe { (alloc(region_layout) as u64, alloc(bitmap_layout) as *mut u64) }
    }

    fn test_allocator(frames: usize) -> (BitmapFrameAllocator, u64) {
        let (base, bitmap) = test_storage(frames);
        let allocator = unsafe {
            BitmapFrameAllocator::new(bitmap, base, (frames * FRAME_SIZE) as u64, &[])
        };
        (allocator, base)
    }

    #[test_case]
    fn next_fit_scenario_over_eight_frames() {
        let (mut pmm, base) = test_allocator(8);
        assert_eq!(pmm.free_frame_count(), 8);

        let block = pmm.alloc_frames(3).expect("8 frames free");
        assert_eq!(block.as_u64(), base);
        assert_eq!(pmm.free_frame_count(), 5);

        // Only 5 contiguous frames remain; the failed search changes nothing.
        assert!(pmm.alloc_frames(8).is_none());
        assert_eq!(pmm.free_frame_count(), 5);

        pmm.free_frames(block, 3).unwrap();
        assert_eq!(pmm.free_frame_count(), 8);
    }

    #[test_case]
    fn allocated_frames_are_zero_filled() {
        let (mut pmm, base) = test_allocator(4);
        unsafe { ptr::write_bytes(base as *mut u8, 0xAB, 4 * FRAME_SIZE) };

        let block = pmm.alloc_frames(2).unwrap();
        let bytes =
            unsafe { slice::from_raw_parts(block.as_u64() as *const u8, 2 * FRAME_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test_case]
    fn is_allocated_tracks_alloc_and_free() {
        let (mut pmm, _) = test_allocator(4);

        let block = pmm.alloc_frames(2).unwrap();
        for i in 0..2 {
            assert!(pmm.is_allocated(block + (i * FRAME_SIZE) as u64));
        }

        pmm.free_frames(block, 2).unwrap();
        for i in 0..2 {
            assert!(!pmm.is_allocated(block + (i * FRAME_SIZE) as u64));
        }

        // Outside the managed region reads as allocated.
        assert!(pmm.is_allocated(PhysAddr::new(0)));
    }

    #[test_case]
    fn cursor_resumes_past_the_previous_allocation() {
        let (mut pmm, base) = test_allocator(8);

        let first = pmm.alloc_frames(2).unwrap();
        pmm.free_frames(first, 2).unwrap();

        // Next-fit starts past the freed block rather than rescanning it.
        let second = pmm.alloc_frames(2).unwrap();
        assert_eq!(second.as_u64(), base + (2 * FRAME_SIZE) as u64);
    }

    #[test_case]
    fn runs_never_span_the_wrap_point() {
        let (mut pmm, base) = test_allocator(4);

        let first = pmm.alloc_frames(3).unwrap();
        pmm.free_frames(first, 3).unwrap();

        // Cursor sits at frame 3. Frames 3 and 0 are both free, but are
        // not adjacent; the run must restart at the wrap.
        let block = pmm.alloc_frames(2).unwrap();
        assert_eq!(block.as_u64(), base);
    }

    #[test_case]
    fn alloc_free_alloc_can_return_the_same_frames() {
        let (mut pmm, _) = test_allocator(4);

        let first = pmm.alloc_frames(4).unwrap();
        pmm.free_frames(first, 4).unwrap();

        let again = pmm.alloc_frames(4).unwrap();
        assert_eq!(again, first);
        assert_eq!(pmm.free_frame_count(), 0);
    }

    #[test_case]
    fn zero_count_allocation_fails() {
        let (mut pmm, _) = test_allocator(4);
        assert!(pmm.alloc_frames(0).is_none());
        assert_eq!(pmm.free_frame_count(), 4);
    }

    #[test_case]
    fn free_rejects_bad_arguments() {
        let (mut pmm, base) = test_allocator(4);

        assert_eq!(
            pmm.free_frames(PhysAddr::new(base + 1), 1),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            pmm.free_frames(PhysAddr::new(base), 0),
            Err(MemoryError::InvalidArgument)
        );
        // Run extends past the region end.
        assert_eq!(
            pmm.free_frames(PhysAddr::new(base), 5),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test_case]
    fn double_free_warns_but_succeeds() {
        let (mut pmm, _) = test_allocator(4);

        let block = pmm.alloc_frames(1).unwrap();
        pmm.free_frames(block, 1).unwrap();
        assert!(pmm.free_frames(block, 1).is_ok());
        assert_eq!(pmm.free_frame_count(), 4);
    }

    #[test_case]
    fn reserve_and_mark_available_are_idempotent() {
        let (mut pmm, base) = test_allocator(8);
        let start = base + FRAME_SIZE as u64;
        let size = (2 * FRAME_SIZE) as u64;

        pmm.reserve_region(start, size);
        assert_eq!(pmm.free_frame_count(), 6);
        pmm.reserve_region(start, size);
        assert_eq!(pmm.free_frame_count(), 6);

        pmm.mark_available(start, size);
        assert_eq!(pmm.free_frame_count(), 8);
        pmm.mark_available(start, size);
        assert_eq!(pmm.free_frame_count(), 8);
    }

    #[test_case]
    fn non_available_regions_start_allocated() {
        let (base, bitmap) = test_storage(8);
        let regions = [
            Region {
                start: base,
                size: (2 * FRAME_SIZE) as u64,
                kind: RegionKind::Reserved,
            },
            Region {
                start: base + (2 * FRAME_SIZE) as u64,
                size: (6 * FRAME_SIZE) as u64,
                kind: RegionKind::Available,
            },
        ];
        let pmm = unsafe {
            BitmapFrameAllocator::new(bitmap, base, (8 * FRAME_SIZE) as u64, &regions)
        };

        assert_eq!(pmm.free_frame_count(), 6);
        assert!(pmm.is_allocated(PhysAddr::new(base)));
        assert!(!pmm.is_allocated(PhysAddr::new(base + (2 * FRAME_SIZE) as u64)));
    }

    #[test_case]
    fn stats_reflect_bitmap_population() {
        let (mut pmm, _) = test_allocator(8);
        pmm.alloc_frames(3).unwrap();

        let stats = pmm.stats();
        assert_eq!(stats.total_frames, 8);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 3);
        assert_eq!(stats.bitmap_bytes, 8);
        assert_eq!(stats.last_allocated, 3);
    }
}
