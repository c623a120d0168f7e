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

use crate::mem::MemoryRegionFlags;

/// Stub emulation callbacks consulted on I/O-port and memory-access exits
pub mod emulator;
/// Reading interrupt state and injecting pending interrupts into a VP
pub mod interrupt;
/// Ownership of the platform partition handle and VP creation ordering
pub mod partition;
/// The opaque virtualization platform boundary
pub mod platform;
/// Single-slot capture/restore of a VP's full register set
pub mod snapshot;
/// The virtual processor: register cache, guest memory build and run/exit
/// dispatch
pub mod vcpu;
/// Windows Hypervisor Platform backend
#[cfg(target_os = "windows")]
pub mod whp;

/// A classified VM exit returned by the platform's run-VP primitive.
///
/// Carries the reason-specific context the dispatcher needs; anything the
/// platform reports that has no counterpart here surfaces as `Other` with
/// the raw reason code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    /// The guest issued a vmcall/vmmcall
    Hypercall {
        /// Guest instruction pointer at the exit
        rip: u64,
        /// Guest rax at the exit, where hypercall arguments would live
        rax: u64,
    },
    /// The guest trapped accessing unmapped or protected guest-physical
    /// memory
    MemoryAccess {
        /// Faulting guest-physical address
        gpa: u64,
        /// Faulting guest-virtual address
        gva: u64,
        /// The kind of access that trapped
        access: MemoryRegionFlags,
        /// Raw bytes of the faulting instruction; may be empty when the
        /// platform could not fetch them
        instruction_bytes: Vec<u8>,
    },
    /// The guest accessed an I/O port
    IoPortAccess {
        /// The port number
        port: u16,
        /// Whether the access was a write
        is_write: bool,
        /// Access width in bytes
        access_size: u16,
        /// Guest rax at the exit
        rax: u64,
    },
    /// The guest halted
    Halt,
    /// The run was cancelled by the host
    Cancelled,
    /// An exit reason the dispatcher does not handle, with the raw platform
    /// reason code
    Other(u32),
}
