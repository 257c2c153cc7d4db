//! Peripheral device access.
//!
//! Only the serial port lives here; every other peripheral (keyboard,
//! display) talks to the memory core through its public interface and is
//! not part of this kernel.

pub mod serial;
