//! The Kernel Heap
//! Backs the global allocator with the Talc allocator over the heap range.
//! The range is identity mapped by the translation manager during boot;
//! Talc claims it lazily on the first allocation.

use talc::{ClaimOnOom, Span, Talc, Talck};

use crate::constants::memory::{HEAP_SIZE, HEAP_START};

#[global_allocator]
static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
    ClaimOnOom::new(Span::new(HEAP_START, HEAP_START.wrapping_add(HEAP_SIZE)))
})
.lock();
