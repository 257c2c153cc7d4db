//! Memory management: physical-frame allocation and address translation.
//!
//! Bring-up order matters. The address gate comes first, because both
//! allocators live above 1 MiB; the bitmap allocator next, so later
//! subsystems can take frames; then the table hierarchy, the boot
//! mappings, and the switch to paged mode. The gate being unconfirmable
//! is survivable, a failed hierarchy build is not.

pub mod a20;
pub mod bitmap_frame_allocator;
pub mod boot_frame_allocator;
pub mod error;
pub mod heap;
pub mod paging;

pub use error::MemoryError;

use crate::constants::memory::IDENTITY_MAP_SIZE;

/// Boot-time bring-up of the memory core.
pub fn init() {
    if a20::ensure_extended_addressing().is_err() {
        log::warn!("could not confirm the address gate is open, continuing anyway");
    }

    bitmap_frame_allocator::init();
    bitmap_frame_allocator::with_frame_allocator(|allocator| {
        allocator.log_stats();
        allocator.log_memory_map();
    });

    paging::init();
    paging::with_kernel_space(|space| {
        space
            .identity_map(0, IDENTITY_MAP_SIZE)
            .expect("identity mapping failed");
        space.map_heap().expect("heap mapping failed");
        space.activate();
        space.log_table_frame_usage();
    });

    log::info!("memory management online");
}
