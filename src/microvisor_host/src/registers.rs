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

use std::fmt;
use std::str::FromStr;

use crate::error::MicrovisorError;
use crate::Result;

/// The number of registers transferred by a bulk register get/set.
pub const REGISTER_COUNT: usize = 33;

/// An architectural register understood by the platform boundary.
///
/// The first [`REGISTER_COUNT`] variants make up the fixed list moved in bulk
/// between the platform and a virtual processor's register cache, in the
/// order of [`REGISTER_NAMES`]. `InterruptState` is only read by the
/// interrupt controller and is not part of the bulk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RegisterName {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Gdtr,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
    Efer,
    Lstar,
    PendingInterruption,
    InterruptState,
}

/// The fixed register list used for bulk register transfers, save/restore
/// and snapshots. Order is part of the cache layout contract.
pub const REGISTER_NAMES: [RegisterName; REGISTER_COUNT] = [
    RegisterName::Rax,
    RegisterName::Rbx,
    RegisterName::Rcx,
    RegisterName::Rdx,
    RegisterName::Rsi,
    RegisterName::Rdi,
    RegisterName::Rsp,
    RegisterName::Rbp,
    RegisterName::R8,
    RegisterName::R9,
    RegisterName::R10,
    RegisterName::R11,
    RegisterName::R12,
    RegisterName::R13,
    RegisterName::R14,
    RegisterName::R15,
    RegisterName::Rip,
    RegisterName::Rflags,
    RegisterName::Es,
    RegisterName::Cs,
    RegisterName::Ss,
    RegisterName::Ds,
    RegisterName::Fs,
    RegisterName::Gs,
    RegisterName::Gdtr,
    RegisterName::Cr0,
    RegisterName::Cr2,
    RegisterName::Cr3,
    RegisterName::Cr4,
    RegisterName::Cr8,
    RegisterName::Efer,
    RegisterName::Lstar,
    RegisterName::PendingInterruption,
];

impl RegisterName {
    /// The lower-case name used for lookups and register dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterName::Rax => "rax",
            RegisterName::Rbx => "rbx",
            RegisterName::Rcx => "rcx",
            RegisterName::Rdx => "rdx",
            RegisterName::Rsi => "rsi",
            RegisterName::Rdi => "rdi",
            RegisterName::Rsp => "rsp",
            RegisterName::Rbp => "rbp",
            RegisterName::R8 => "r8",
            RegisterName::R9 => "r9",
            RegisterName::R10 => "r10",
            RegisterName::R11 => "r11",
            RegisterName::R12 => "r12",
            RegisterName::R13 => "r13",
            RegisterName::R14 => "r14",
            RegisterName::R15 => "r15",
            RegisterName::Rip => "rip",
            RegisterName::Rflags => "rflags",
            RegisterName::Es => "es",
            RegisterName::Cs => "cs",
            RegisterName::Ss => "ss",
            RegisterName::Ds => "ds",
            RegisterName::Fs => "fs",
            RegisterName::Gs => "gs",
            RegisterName::Gdtr => "gdtr",
            RegisterName::Cr0 => "cr0",
            RegisterName::Cr2 => "cr2",
            RegisterName::Cr3 => "cr3",
            RegisterName::Cr4 => "cr4",
            RegisterName::Cr8 => "cr8",
            RegisterName::Efer => "efer",
            RegisterName::Lstar => "lstar",
            RegisterName::PendingInterruption => "pending_interruption",
            RegisterName::InterruptState => "interrupt_state",
        }
    }

    /// The position of this register in [`REGISTER_NAMES`], or a
    /// `RegisterNotFound` error for registers outside the bulk list.
    pub fn cache_index(&self) -> Result<usize> {
        REGISTER_NAMES
            .iter()
            .position(|name| name == self)
            .ok_or_else(|| MicrovisorError::RegisterNotFound(self.as_str().to_string()))
    }
}

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegisterName {
    type Err = MicrovisorError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        REGISTER_NAMES
            .iter()
            .chain(std::iter::once(&RegisterName::InterruptState))
            .find(|name| name.as_str() == lowered)
            .copied()
            .ok_or(MicrovisorError::RegisterNotFound(lowered))
    }
}

/// CR0 control register bits.
pub mod cr0 {
    /// Protected mode enable
    pub const PE: u64 = 1 << 0;
    /// Monitor co-processor
    pub const MP: u64 = 1 << 1;
    /// x87 emulation
    pub const EM: u64 = 1 << 2;
    /// Task switched
    pub const TS: u64 = 1 << 3;
    /// Extension type
    pub const ET: u64 = 1 << 4;
    /// Numeric error reporting
    pub const NE: u64 = 1 << 5;
    /// Supervisor write protect
    pub const WP: u64 = 1 << 16;
    /// Alignment mask
    pub const AM: u64 = 1 << 18;
    /// Paging enable
    pub const PG: u64 = 1 << 31;
}

/// CR4 control register bits.
pub mod cr4 {
    /// Page size extensions
    pub const PSE: u64 = 1 << 4;
    /// Physical address extension
    pub const PAE: u64 = 1 << 5;
    /// FXSAVE/FXRSTOR support
    pub const OSFXSR: u64 = 1 << 9;
    /// Unmasked SIMD exception support
    pub const OSXMMEXCPT: u64 = 1 << 10;
}

/// Extended feature enable register (EFER) bits.
pub mod efer {
    /// Syscall enable
    pub const SCE: u64 = 1 << 0;
    /// Long mode enable
    pub const LME: u64 = 1 << 8;
    /// Long mode active
    pub const LMA: u64 = 1 << 10;
    /// No-execute enable
    pub const NXE: u64 = 1 << 11;
}

/// 64-bit page-table entry bits.
pub mod pte {
    /// Entry is present
    pub const PRESENT: u64 = 1 << 0;
    /// Entry is writable
    pub const RW: u64 = 1 << 1;
    /// Entry is accessible from user mode
    pub const USER: u64 = 1 << 2;
    /// Entry maps a large page
    pub const PS: u64 = 1 << 7;
    /// Entry is not executable
    pub const NX: u64 = 1 << 63;
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn bulk_list_has_fixed_size_and_order() {
        assert_eq!(REGISTER_NAMES.len(), REGISTER_COUNT);
        assert_eq!(REGISTER_NAMES[0], RegisterName::Rax);
        assert_eq!(REGISTER_NAMES[16], RegisterName::Rip);
        assert_eq!(REGISTER_NAMES[32], RegisterName::PendingInterruption);
    }

    #[test]
    fn cache_index_matches_bulk_order() {
        for (i, name) in REGISTER_NAMES.iter().enumerate() {
            assert_eq!(name.cache_index().unwrap(), i);
        }
    }

    #[test]
    fn interrupt_state_is_not_in_the_bulk_list() {
        let err = RegisterName::InterruptState.cache_index().unwrap_err();
        assert!(matches!(err, MicrovisorError::RegisterNotFound(_)));
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        assert_eq!(RegisterName::from_str("RIP").unwrap(), RegisterName::Rip);
        assert_eq!(RegisterName::from_str(" cr3 ").unwrap(), RegisterName::Cr3);
        assert_eq!(
            RegisterName::from_str("interrupt_state").unwrap(),
            RegisterName::InterruptState
        );
        assert!(RegisterName::from_str("xmm0").is_err());
    }
}
