//! Kernel bring-up.

use crate::{interrupts, logging, memory};

/// Single-core boot sequence: logging first so every later stage can
/// report, exception handlers next so bring-up faults are caught, then the
/// memory core. Interrupt delivery stays off until the caller enables it.
pub fn init() {
    logging::init();
    interrupts::init();
    memory::init();
}
