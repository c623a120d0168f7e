/*
Copyright 2025 The Microvisor Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use log::debug;

/// Emulation callbacks consulted by the exit dispatcher for I/O-port and
/// memory-access exits.
///
/// This is a capability interface, not an instruction emulator: the run loop
/// depends only on these hooks and implementations decide what the accesses
/// mean. The default [`FixedEmulator`] returns fixed fixture values.
pub trait Emulator: Send + Sync + std::fmt::Debug {
    /// Handles a read from an I/O port, returning the value the guest
    /// would observe.
    fn io_read(&self, port: u16, access_size: u16) -> u64;
    /// Handles a write to an I/O port.
    fn io_write(&self, port: u16, access_size: u16, value: u64);
    /// Handles a read from guest-physical memory.
    fn mem_read(&self, gpa: u64, access_size: usize) -> u64;
    /// Handles a write to guest-physical memory.
    fn mem_write(&self, gpa: u64, access_size: usize, value: u64);
    /// Translates a guest-virtual address for emulation purposes.
    fn translate_gva(&self, gva: u64) -> u64;
}

/// The stub emulator: port reads observe 0xFF, memory reads observe 0xAB,
/// writes are logged and dropped, translation is the identity.
#[derive(Debug, Default)]
pub struct FixedEmulator;

impl Emulator for FixedEmulator {
    fn io_read(&self, port: u16, access_size: u16) -> u64 {
        debug!("io_read port {:#x} size {}", port, access_size);
        0xFF
    }

    fn io_write(&self, port: u16, access_size: u16, value: u64) {
        debug!(
            "io_write port {:#x} size {} value {:#x}",
            port, access_size, value
        );
    }

    fn mem_read(&self, gpa: u64, access_size: usize) -> u64 {
        debug!("mem_read gpa {:#x} size {}", gpa, access_size);
        0xAB
    }

    fn mem_write(&self, gpa: u64, access_size: usize, value: u64) {
        debug!(
            "mem_write gpa {:#x} size {} value {:#x}",
            gpa, access_size, value
        );
    }

    fn translate_gva(&self, gva: u64) -> u64 {
        gva
    }
}
