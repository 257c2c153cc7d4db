//! PAE address translation.
//!
//! Three-level hierarchy: a four-slot top-level table, one 512-entry
//! directory per slot, and 512-entry leaf tables created on demand. A
//! 32-bit virtual address splits 2/9/9/12 across the levels. Directories
//! exist eagerly from the moment the hierarchy is built; leaf tables are
//! materialized from the bootstrap frame supplier on first use and never
//! destroyed. Table memory is reached through its physical address, which
//! stays valid before paging is active and under the identity map after.

use raw_cpuid::CpuId;
use spin::Mutex;
use x86_64::{
    instructions::{interrupts::without_interrupts, tlb},
    registers::control::{Cr0, Cr0Flags, Cr3, Cr3Flags, Cr4, Cr4Flags},
    structures::paging::{page_table::PageTableEntry, PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{boot_frame_allocator::BootFrameAllocator, error::MemoryError};
use crate::constants::memory::{HEAP_BASE, HEAP_SIZE, PAGE_SIZE, PDPT_ENTRY_COUNT};

/// Kernel address space; `None` until [`init`] has run.
pub static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// The 32-bit virtual space the hierarchy covers.
const VIRT_SPACE_SIZE: u64 = 1 << 32;

/// Top-level table: four 8-byte slots, one per gigabyte.
#[repr(C, align(32))]
pub struct PageDirectoryPointerTable {
    entries: [PageTableEntry; PDPT_ENTRY_COUNT],
}

/// Owns the table hierarchy and the bootstrap supplier its frames come
/// from. A constructed value means the hierarchy is built; `activate`
/// additionally commits it to the control registers.
pub struct AddressSpace {
    top_level: PhysFrame,
    table_frames: BootFrameAllocator,
    active: bool,
}

fn pdpt_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 30) & 0x3) as usize
}

fn directory_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 21) & 0x1FF) as usize
}

fn table_index(virt: VirtAddr) -> usize {
    ((virt.as_u64() >> 12) & 0x1FF) as usize
}

fn page_offset(virt: VirtAddr) -> u64 {
    virt.as_u64() & 0xFFF
}

impl AddressSpace {
    /// Builds the hierarchy: one frame for the top-level table, then one
    /// directory per slot, each linked present. Leaf tables are left to
    /// `map_page`. A misaligned table frame aborts the build; the caller
    /// decides whether that is survivable.
    pub fn build(mut table_frames: BootFrameAllocator) -> Result<Self, MemoryError> {
        let top_addr = table_frames.take_frame().ok_or(MemoryError::OutOfMemory)?;
        let top_level =
            PhysFrame::from_start_address(top_addr).map_err(|_| MemoryError::TableMisaligned)?;

        let top = top_addr.as_u64() as *mut PageDirectoryPointerTable;
        for slot in 0..PDPT_ENTRY_COUNT {
            let directory = table_frames.take_frame().ok_or(MemoryError::OutOfMemory)?;
            if !directory.is_aligned(PAGE_SIZE) {
                return Err(MemoryError::TableMisaligned);
            }
            unsafe {
                (*top).entries[slot].set_addr(directory, PageTableFlags::PRESENT);
            }
            log::debug!("directory {} at {:#x}", slot, directory.as_u64());
        }
        log::debug!("top-level table at {:#x}", top_addr.as_u64());

        Ok(AddressSpace {
            top_level,
            table_frames,
            active: false,
        })
    }

    /// Installs `virt -> phys` with the given flag bits, overwriting any
    /// prior entry for that page. The leaf table is created on demand with
    /// present and writable set, passing the caller's user bit through.
    /// The stale translation is invalidated before returning.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        if virt.as_u64() >= VIRT_SPACE_SIZE
            || !virt.is_aligned(PAGE_SIZE)
            || !phys.is_aligned(PAGE_SIZE)
        {
            return Err(MemoryError::InvalidArgument);
        }

        let top = self.top_level.start_address().as_u64() as *mut PageDirectoryPointerTable;
        let top_entry = unsafe { &(*top).entries[pdpt_index(virt)] };
        if !top_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MemoryError::MissingDirectory);
        }

        let directory = unsafe { &mut *(top_entry.addr().as_u64() as *mut PageTable) };
        let directory_entry = &mut directory[directory_index(virt)];
        if !directory_entry.flags().contains(PageTableFlags::PRESENT) {
            let table = self
                .table_frames
                .take_frame()
                .ok_or(MemoryError::OutOfMemory)?;
            let table_flags = PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | (flags & PageTableFlags::USER_ACCESSIBLE);
            directory_entry.set_addr(table, table_flags);
        }

        let table = unsafe { &mut *(directory_entry.addr().as_u64() as *mut PageTable) };
        table[table_index(virt)].set_addr(phys, flags);

        tlb::flush(virt);
        Ok(())
    }

    /// Clears the leaf entry for `virt` and invalidates its translation.
    /// The leaf table itself stays in place even when it becomes empty.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<(), MemoryError> {
        if virt.as_u64() >= VIRT_SPACE_SIZE {
            return Err(MemoryError::NotMapped);
        }

        let top = self.top_level.start_address().as_u64() as *mut PageDirectoryPointerTable;
        let top_entry = unsafe { &(*top).entries[pdpt_index(virt)] };
        if !top_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }

        let directory = unsafe { &mut *(top_entry.addr().as_u64() as *mut PageTable) };
        let directory_entry = &directory[directory_index(virt)];
        if !directory_entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MemoryError::NotMapped);
        }

        let table = unsafe { &mut *(directory_entry.addr().as_u64() as *mut PageTable) };
        let leaf = &mut table[table_index(virt)];
        if leaf.is_unused() {
            return Err(MemoryError::NotMapped);
        }
        leaf.set_unused();

        tlb::flush(virt);
        Ok(())
    }

    /// Walks the hierarchy without touching it. `None` as soon as any
    /// level lacks the present flag.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        if virt.as_u64() >= VIRT_SPACE_SIZE {
            return None;
        }

        let top = self.top_level.start_address().as_u64() as *const PageDirectoryPointerTable;
        let top_entry = unsafe { &(*top).entries[pdpt_index(virt)] };
        if !top_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        let directory = unsafe { &*(top_entry.addr().as_u64() as *const PageTable) };
        let directory_entry = &directory[directory_index(virt)];
        if !directory_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        let table = unsafe { &*(directory_entry.addr().as_u64() as *const PageTable) };
        let leaf = &table[table_index(virt)];
        if !leaf.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        Some(leaf.addr() + page_offset(virt))
    }

    /// Commits the hierarchy to the control registers, in fixed order:
    /// paging off, extended addressing on, top-level table loaded, paging
    /// on. The base register may only be loaded while paging is off, and
    /// extended addressing must precede the paging enable. Safe to re-run;
    /// the sequence is idempotent over an already-active space.
    ///
    /// There is no rollback: a processor without extended addressing
    /// leaves nothing to continue with, so that halts.
    pub fn activate(&mut self) {
        let pae_supported = CpuId::new()
            .get_feature_info()
            .is_some_and(|features| features.has_pae());
        if !pae_supported {
            panic!("CPU does not support extended physical addressing");
        }

        unsafe {
            Cr0::update(|cr0| cr0.remove(Cr0Flags::PAGING));
            Cr4::update(|cr4| cr4.insert(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION));
            Cr3::write(self.top_level, Cr3Flags::empty());
            Cr0::update(|cr0| cr0.insert(Cr0Flags::PAGING));
        }

        self.active = true;
        log::info!(
            "paging active, top-level table at {:#x}",
            self.top_level.start_address().as_u64()
        );
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Logs the bootstrap supplier's lifetime tallies.
    pub fn log_table_frame_usage(&self) {
        self.table_frames.log_usage();
    }

    /// Maps `[start, start + size)` onto itself, present and writable.
    pub fn identity_map(&mut self, start: u64, size: u64) -> Result<(), MemoryError> {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let mut addr = start;
        while addr < start + size {
            self.map_page(VirtAddr::new(addr), PhysAddr::new(addr), flags)?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Maps the configured heap range 1:1 so the global allocator can
    /// claim it.
    pub fn map_heap(&mut self) -> Result<(), MemoryError> {
        self.identity_map(HEAP_BASE, HEAP_SIZE as u64)
    }
}

/// Builds the kernel address space over the configured boot pool. A second
/// call is a no-op. A failed build panics: without a valid hierarchy there
/// is no address space to fall back to.
pub fn init() {
    without_interrupts(|| {
        let mut guard = KERNEL_SPACE.lock();
        if guard.is_some() {
            return;
        }
        let table_frames = unsafe { BootFrameAllocator::new() };
        let space =
            AddressSpace::build(table_frames).expect("building the page-table hierarchy failed");
        *guard = Some(space);
    });
}

/// Runs `f` on the kernel address space with interrupts masked for the
/// duration. Panics when [`init`] has not run.
pub fn with_kernel_space<F, R>(f: F) -> R
where
    F: FnOnce(&mut AddressSpace) -> R,
{
    without_interrupts(|| {
        let mut guard = KERNEL_SPACE.lock();
        let space = guard.as_mut().expect("kernel address space not initialized");
        f(space)
    })
}

/// Maps a page in the kernel address space.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MemoryError> {
    without_interrupts(|| {
        KERNEL_SPACE
            .lock()
            .as_mut()
            .ok_or(MemoryError::MissingDirectory)?
            .map_page(virt, phys, flags)
    })
}

/// Unmaps a page from the kernel address space.
pub fn unmap_page(virt: VirtAddr) -> Result<(), MemoryError> {
    without_interrupts(|| {
        KERNEL_SPACE
            .lock()
            .as_mut()
            .ok_or(MemoryError::NotMapped)?
            .unmap_page(virt)
    })
}

/// Looks up the physical address backing `virt`, if any.
pub fn translate_addr(virt: VirtAddr) -> Option<PhysAddr> {
    KERNEL_SPACE
        .lock()
        .as_ref()
        .and_then(|space| space.translate(virt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::FRAME_SIZE;
    use alloc::alloc::{alloc, Layout};

    /// Hierarchy over a heap-backed frame pool, never activated.
    fn test_space(pool_frames: usize) -> AddressSpace {
        let layout = Layout::from_size_align(pool_frames * FRAME_SIZE, FRAME_SIZE).unwrap();
        let start = unsafe { alloc(layout) } as u64;
        let supplier = unsafe {
            BootFrameAllocator::with_pool(start, start + (pool_frames * FRAME_SIZE) as u64)
        };
        AddressSpace::build(supplier).expect("hierarchy build")
    }

    const RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    #[test_case]
    fn map_then_translate_round_trips() {
        let mut space = test_space(8);
        let virt = VirtAddr::new(0x0040_0000);
        let phys = PhysAddr::new(0x0080_0000);

        space.map_page(virt, phys, RW).unwrap();
        assert_eq!(space.translate(virt), Some(phys));

        // Offset bits pass straight through.
        assert_eq!(
            space.translate(VirtAddr::new(0x0040_0123)),
            Some(PhysAddr::new(0x0080_0123))
        );
    }

    #[test_case]
    fn remap_overwrites_without_unmap() {
        let mut space = test_space(8);
        let virt = VirtAddr::new(0);

        space.map_page(virt, PhysAddr::new(0), RW).unwrap();
        space.map_page(virt, PhysAddr::new(0x1000), RW).unwrap();

        assert_eq!(space.translate(virt), Some(PhysAddr::new(0x1000)));
    }

    #[test_case]
    fn unmap_clears_the_translation() {
        let mut space = test_space(8);
        let virt = VirtAddr::new(0x0020_0000);

        space.map_page(virt, PhysAddr::new(0x0060_0000), RW).unwrap();
        assert!(space.translate(virt).is_some());

        space.unmap_page(virt).unwrap();
        assert_eq!(space.translate(virt), None);
        assert_eq!(space.unmap_page(virt), Err(MemoryError::NotMapped));
    }

    #[test_case]
    fn fresh_space_translates_nothing() {
        let space = test_space(8);
        assert_eq!(space.translate(VirtAddr::new(0)), None);
        assert_eq!(space.translate(VirtAddr::new(0xB8000)), None);
    }

    #[test_case]
    fn unmap_of_unmapped_address_reports_not_mapped() {
        let mut space = test_space(8);
        assert_eq!(
            space.unmap_page(VirtAddr::new(0x0010_0000)),
            Err(MemoryError::NotMapped)
        );
    }

    #[test_case]
    fn misaligned_addresses_are_rejected() {
        let mut space = test_space(8);
        assert_eq!(
            space.map_page(VirtAddr::new(0x123), PhysAddr::new(0), RW),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            space.map_page(VirtAddr::new(0x1000), PhysAddr::new(0x123), RW),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test_case]
    fn addresses_past_the_32_bit_space_are_rejected() {
        let mut space = test_space(8);
        let beyond = VirtAddr::new(1 << 32);

        assert_eq!(
            space.map_page(beyond, PhysAddr::new(0), RW),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(space.unmap_page(beyond), Err(MemoryError::NotMapped));
        assert_eq!(space.translate(beyond), None);
    }

    #[test_case]
    fn leaf_tables_are_created_once_per_window() {
        let mut space = test_space(8);

        // Build took one frame for the top level and one per directory.
        let (after_build, _) = space.table_frames.usage();
        assert_eq!(after_build, 1 + PDPT_ENTRY_COUNT);

        // Two pages in the same 2 MiB window share one leaf table.
        space.map_page(VirtAddr::new(0x0000), PhysAddr::new(0x3000), RW).unwrap();
        space.map_page(VirtAddr::new(0x1000), PhysAddr::new(0x4000), RW).unwrap();
        assert_eq!(space.table_frames.usage().0, after_build + 1);

        // A different window materializes its own table.
        space
            .map_page(VirtAddr::new(0x0020_0000), PhysAddr::new(0x5000), RW)
            .unwrap();
        assert_eq!(space.table_frames.usage().0, after_build + 2);
    }

    #[test_case]
    fn exhausted_table_pool_reports_out_of_memory() {
        // Pool covers exactly the build; the first leaf table must fail.
        let mut space = test_space(1 + PDPT_ENTRY_COUNT);
        assert_eq!(
            space.map_page(VirtAddr::new(0), PhysAddr::new(0), RW),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(space.translate(VirtAddr::new(0)), None);
    }

    #[test_case]
    fn user_bit_propagates_to_the_leaf_table() {
        let mut space = test_space(8);
        let virt = VirtAddr::new(0x0040_0000);

        space
            .map_page(
                virt,
                PhysAddr::new(0x0080_0000),
                RW | PageTableFlags::USER_ACCESSIBLE,
            )
            .unwrap();

        let top =
            space.top_level.start_address().as_u64() as *const PageDirectoryPointerTable;
        let top_entry = unsafe { &(*top).entries[pdpt_index(virt)] };
        let directory = unsafe { &*(top_entry.addr().as_u64() as *const PageTable) };
        let flags = directory[directory_index(virt)].flags();

        assert!(flags.contains(
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
        ));
    }
}
