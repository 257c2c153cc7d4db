//! Address-gate (A20) control.
//!
//! While the gate is closed the chipset wraps physical addresses above
//! 1 MiB onto their low-memory aliases, so nothing past the first megabyte
//! may be touched until the gate is confirmed open. The probe is the only
//! authority: every enable strategy is validated by re-probing before the
//! next one is tried.

use core::ptr::{read_volatile, write_volatile};

use x86_64::instructions::port::Port;

use super::error::MemoryError;
use crate::constants::ports::{
    IO_DELAY_PORT, KBC_DATA_PORT, KBC_STATUS_PORT, SYSTEM_CONTROL_PORT_A,
};

/// Probe address above 1 MiB and the alias it wraps onto when the gate is
/// closed.
const PROBE_HIGH: usize = 0x0011_2345;
const PROBE_LOW: usize = 0x0001_2345;

const PROBE_PATTERN: u32 = 0x1234_5678;
const ALIAS_PATTERN: u32 = 0x8765_4321;

const KBC_DISABLE_DEVICE: u8 = 0xAD;
const KBC_ENABLE_DEVICE: u8 = 0xAE;
const KBC_READ_COMMAND_BYTE: u8 = 0xD0;
const KBC_WRITE_COMMAND_BYTE: u8 = 0xD1;
const KBC_OUTPUT_FULL: u8 = 0x01;
const KBC_INPUT_FULL: u8 = 0x02;
const COMMAND_BYTE_GATE_BIT: u8 = 0x02;

/// Fallback chain, tried in order after the initial probe.
const STRATEGIES: &[(&str, fn())] = &[
    ("keyboard controller", enable_via_keyboard_controller),
    ("system control port", enable_via_system_control_port),
];

/// Makes sure addresses above 1 MiB are usable unaliased.
///
/// Probes first; if the gate is already open nothing is written to any
/// controller. Otherwise each strategy runs once, followed by a settle
/// delay and a re-probe. Exhausting the chain is reported to the caller,
/// not escalated: some machines have no gate to open.
pub fn ensure_extended_addressing() -> Result<(), MemoryError> {
    if gate_is_open() {
        log::info!("address gate already open");
        return Ok(());
    }

    for (name, enable) in STRATEGIES {
        log::debug!("trying {} gate enable", name);
        enable();
        io_delay();
        if gate_is_open() {
            log::info!("address gate opened via {}", name);
            return Ok(());
        }
    }

    Err(MemoryError::GateClosed)
}

/// Writes distinct sentinels above and below the wrap point and reads the
/// high address back: if it kept its value, the two locations are separate
/// memory and the gate is open. Both locations are restored afterwards.
fn gate_is_open() -> bool {
    let high = PROBE_HIGH as *mut u32;
    let low = PROBE_LOW as *mut u32;

    unsafe {
        let saved_high = read_volatile(high);
        let saved_low = read_volatile(low);

        write_volatile(high, PROBE_PATTERN);
        write_volatile(low, ALIAS_PATTERN);
        let open = read_volatile(high) == PROBE_PATTERN;

        write_volatile(high, saved_high);
        write_volatile(low, saved_low);
        open
    }
}

/// Classic enable path: set bit 1 of the keyboard controller's command
/// byte with the device disabled around the read-modify-write.
fn enable_via_keyboard_controller() {
    let mut status: Port<u8> = Port::new(KBC_STATUS_PORT);
    let mut data: Port<u8> = Port::new(KBC_DATA_PORT);

    unsafe {
        status.write(KBC_DISABLE_DEVICE);

        status.write(KBC_READ_COMMAND_BYTE);
        while status.read() & KBC_OUTPUT_FULL == 0 {}
        let command_byte = data.read() | COMMAND_BYTE_GATE_BIT;

        status.write(KBC_WRITE_COMMAND_BYTE);
        while status.read() & KBC_INPUT_FULL != 0 {}
        data.write(command_byte);

        status.write(KBC_ENABLE_DEVICE);
        while status.read() & KBC_INPUT_FULL != 0 {}
    }
}

/// Chipset path: bit 1 of system control port A. Bit 0 resets the machine,
/// so the value is only written when the gate bit is actually clear.
fn enable_via_system_control_port() {
    let mut port: Port<u8> = Port::new(SYSTEM_CONTROL_PORT_A);

    unsafe {
        let value = port.read();
        if value & 0x02 == 0 {
            port.write(value | 0x02);
        }
    }
}

fn io_delay() {
    let mut port: Port<u8> = Port::new(IO_DELAY_PORT);
    unsafe { port.write(0) };
}
