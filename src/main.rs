#![no_std]
#![no_main]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(ferrite::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

use ferrite::{
    idle_loop, init,
    interrupts::idt,
    memory::{bitmap_frame_allocator, paging},
    serial_println,
};

#[no_mangle]
extern "C" fn kmain() -> ! {
    init::init();

    #[cfg(test)]
    test_main();

    // A peripheral driver maps its device memory through the translation
    // manager; the VGA text buffer stands in for a framebuffer here.
    let text_buffer = VirtAddr::new(0xB8000);
    paging::map_page(
        text_buffer,
        PhysAddr::new(0xB8000),
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE,
    )
    .expect("mapping the text buffer failed");
    serial_println!(
        "{:?} -> {:?}",
        text_buffer,
        paging::translate_addr(text_buffer)
    );

    // Allocator smoke test: take a frame, check the bookkeeping, put it
    // back.
    let frame = bitmap_frame_allocator::alloc_frame().expect("no free frames");
    let allocated = bitmap_frame_allocator::with_frame_allocator(|allocator| {
        allocator.is_allocated(frame.start_address())
    });
    serial_println!("allocated {:?}, bitmap bit set: {}", frame, allocated);
    bitmap_frame_allocator::dealloc_frame(frame);

    bitmap_frame_allocator::with_frame_allocator(|allocator| allocator.log_stats());

    idt::enable();
    log::info!("system ready");

    idle_loop()
}

#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop()
}

#[cfg(test)]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    ferrite::test_panic_handler(info)
}
