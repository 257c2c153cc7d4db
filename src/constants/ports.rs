//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// Keyboard controller status/command port.
pub const KBC_STATUS_PORT: u16 = 0x64;

/// Keyboard controller data port.
pub const KBC_DATA_PORT: u16 = 0x60;

/// System control port A, carries the fast address-gate bit.
pub const SYSTEM_CONTROL_PORT_A: u16 = 0x92;

/// Scratch port written for short I/O settle delays.
pub const IO_DELAY_PORT: u16 = 0x80;

/// QEMU isa-debug-exit device, used by the test harness.
pub const QEMU_EXIT_PORT: u16 = 0xF4;
