//! Physical memory layout.
//!
//! Single source of truth for every fixed address range the kernel touches.
//! The bootstrap page-table pool and the bitmap-managed region are kept
//! disjoint here; the assertions at the bottom refuse to compile a layout
//! in which any two ranges overlap.

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Kernel image as placed by the stage-2 loader.
pub const KERNEL_START: u64 = 0x8000;
pub const KERNEL_END: u64 = 0x2_0000;

/// Kernel heap, identity mapped and claimed by the global allocator.
pub const HEAP_BASE: u64 = 0x2_0000;
pub const HEAP_SIZE: usize = 0x0100_0000; // 16 MiB
pub const HEAP_START: *mut u8 = HEAP_BASE as *mut u8;

/// Pool the bootstrap supplier carves page-table frames from.
pub const BOOT_POOL_START: u64 = 0x0102_0000;
pub const BOOT_POOL_SIZE: u64 = 0x0040_0000; // 4 MiB, 1024 frames

/// Region owned by the bitmap frame allocator.
pub const MANAGED_START: u64 = 0x0142_0000;
pub const MANAGED_SIZE: u64 = 0x0100_0000; // 16 MiB

/// Low physical memory mapped 1:1 at boot. Must cover every range above.
pub const IDENTITY_MAP_SIZE: u64 = 0x0400_0000; // 64 MiB

/// Capacity of the region-descriptor table.
pub const MAX_REGIONS: usize = 16;
pub const BITMAP_ENTRY_BITS: usize = 64;

/// PAE table geometry: four top-level slots, 512 8-byte entries per table.
pub const PDPT_ENTRY_COUNT: usize = 4;
pub const TABLE_ENTRY_COUNT: usize = 512;

const _: () = assert!(KERNEL_START < KERNEL_END);
const _: () = assert!(KERNEL_END <= HEAP_BASE);
const _: () = assert!(HEAP_BASE + HEAP_SIZE as u64 <= BOOT_POOL_START);
const _: () = assert!(BOOT_POOL_START + BOOT_POOL_SIZE <= MANAGED_START);
const _: () = assert!(MANAGED_START + MANAGED_SIZE <= IDENTITY_MAP_SIZE);
