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

use std::fmt::Write as _;
use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tracing::{instrument, Span};

use super::emulator::Emulator;
use super::platform::{
    CapabilityCode, PartitionHandle, Platform, ProcessorCounters, ProcessorVendor,
};
use super::VmExit;
use crate::error::MicrovisorError;
use crate::mem::{MemoryRegionFlags, DEFAULT_MEMORY_SIZE};
use crate::registers::{pte, RegisterName, REGISTER_COUNT, REGISTER_NAMES};
use crate::{log_then_return, Result};

/// Guest-physical base of the hand-built kernel page tables.
pub const KERNEL_BASE: u64 = 0x4000;
/// Guest-physical base of the mapped user-space code page.
pub const USER_CODE_BASE: u64 = 0x1_0000_0000;
/// The instruction pointer primed before each run.
pub const KERNEL_ENTRY: u64 = 0x1000;

// Fixed-fixture guest images: one privileged instruction per vendor.
const VMMCALL_SNIPPET: [u8; 3] = [0x0f, 0x01, 0xd9];
const VMCALL_SNIPPET: [u8; 3] = [0x0f, 0x01, 0xc1];

const PAGE_SIZE: usize = 0x1000;

/// The VM configuration record carried by a virtual processor. Only the
/// processor count has a platform side effect; the rest is reporting
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Number of virtual processors
    pub cpu_count: u32,
    /// Logical guest memory size in bytes
    pub memory_size: u64,
    /// Informational description of attached I/O devices
    pub io_devices: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            memory_size: DEFAULT_MEMORY_SIZE,
            io_devices: "none".to_string(),
        }
    }
}

/// One virtual processor: its register cache, saved-state buffer, VM
/// configuration and the run/exit dispatch.
///
/// The cache mirrors the platform's register state for the fixed list in
/// [`REGISTER_NAMES`]; it starts zeroed and is synchronized explicitly via
/// [`VirtualProcessor::get_registers`] and
/// [`VirtualProcessor::set_registers`]. The platform-side VP resource is
/// created by `Partition::create_virtual_processor` and released on drop.
#[derive(Debug)]
pub struct VirtualProcessor {
    platform: Arc<dyn Platform>,
    partition: PartitionHandle,
    index: u32,
    emulator: Arc<dyn Emulator>,
    registers: [u64; REGISTER_COUNT],
    saved_registers: [u64; REGISTER_COUNT],
    state_saved: bool,
    config: VmConfig,
    guest_memory_built: bool,
}

impl VirtualProcessor {
    /// Wraps the already-created platform VP with the given index.
    pub fn new(
        platform: Arc<dyn Platform>,
        partition: PartitionHandle,
        index: u32,
        emulator: Arc<dyn Emulator>,
    ) -> Self {
        Self {
            platform,
            partition,
            index,
            emulator,
            registers: [0; REGISTER_COUNT],
            saved_registers: [0; REGISTER_COUNT],
            state_saved: false,
            config: VmConfig::default(),
            guest_memory_built: false,
        }
    }

    /// The VP index within its partition.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bulk-fetches the full fixed register list into the cache in one
    /// platform call. On failure the cache is left unchanged.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn get_registers(&mut self) -> Result<()> {
        let values = self
            .platform
            .get_registers(self.partition, self.index, &REGISTER_NAMES)?;
        if values.len() != REGISTER_COUNT {
            log_then_return!(
                "Platform returned {} register values, expected {}",
                values.len(),
                REGISTER_COUNT
            );
        }
        self.registers.copy_from_slice(&values);
        Ok(())
    }

    /// Bulk-applies the cache to the platform in one call; the platform
    /// does not roll back partial writes, so registers are never written
    /// one by one here.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_registers(&self) -> Result<()> {
        let values: Vec<(RegisterName, u64)> = REGISTER_NAMES
            .iter()
            .zip(self.registers.iter())
            .map(|(name, value)| (*name, *value))
            .collect();
        self.platform
            .set_registers(self.partition, self.index, &values)
    }

    /// Reads one register from the cache. Names outside the fixed list are
    /// a typed `RegisterNotFound` error, never a silent zero.
    pub fn get_specific_register(&self, name: RegisterName) -> Result<u64> {
        Ok(self.registers[name.cache_index()?])
    }

    /// Writes one register into the cache. The value reaches the platform
    /// on the next [`VirtualProcessor::set_registers`].
    pub fn set_specific_register(&mut self, name: RegisterName, value: u64) -> Result<()> {
        self.registers[name.cache_index()?] = value;
        Ok(())
    }

    /// Refreshes the cache from the platform, then copies it into the saved
    /// buffer. The refresh ensures a save taken after guest execution
    /// reflects the guest's most recent values.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn save_state(&mut self) -> Result<()> {
        self.get_registers()?;
        self.saved_registers = self.registers;
        self.state_saved = true;
        Ok(())
    }

    /// Copies the saved buffer back into the cache and pushes it to the
    /// platform. Fails with `NoStateSaved` before the first successful
    /// [`VirtualProcessor::save_state`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn restore_state(&mut self) -> Result<()> {
        if !self.state_saved {
            log_then_return!(MicrovisorError::NoStateSaved);
        }
        self.registers = self.saved_registers;
        self.set_registers()
    }

    /// Applies the processor count to the partition and stores the config
    /// for reporting. Does not re-create VPs or remap memory.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn configure_vm(&mut self, config: VmConfig) -> Result<()> {
        self.platform
            .set_processor_count(self.partition, config.cpu_count)?;
        info!(
            "VM configured with {} CPU(s), {} bytes of memory, I/O devices: {}",
            config.cpu_count, config.memory_size, config.io_devices
        );
        self.config = config;
        Ok(())
    }

    /// The stored VM configuration.
    pub fn vm_config(&self) -> &VmConfig {
        &self.config
    }

    /// The stored VM configuration rendered as JSON for the RPC/GUI seam.
    pub fn vm_config_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.config)?)
    }

    /// A copy of the current register cache, in [`REGISTER_NAMES`] order.
    pub fn register_values(&self) -> [u64; REGISTER_COUNT] {
        self.registers
    }

    /// Renders the register cache as an aligned name/value hex table.
    pub fn dump_registers(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Registers for virtual processor {}:", self.index);
        for (name, value) in REGISTER_NAMES.iter().zip(self.registers.iter()) {
            let _ = writeln!(out, "  {:<21} = {:#018x}", name.as_str(), value);
        }
        out
    }

    /// The VP's runtime counters, degrading to zeros with a warning when
    /// the platform build does not support them.
    pub fn processor_counters(&self) -> ProcessorCounters {
        match self.platform.processor_counters(self.partition, self.index) {
            Ok(counters) => counters,
            Err(e) => {
                warn!(
                    "Processor counters unavailable on this platform build ({}); reporting zeros",
                    e
                );
                ProcessorCounters::default()
            }
        }
    }

    /// Builds the minimal kernel page tables at [`KERNEL_BASE`]: one PML4
    /// entry pointing at a PDPT whose first entry maps a 1 GiB page at
    /// guest-physical zero, present/writable/user. The host-side scratch
    /// buffer is freed as soon as the mapping call returns.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn setup_kernel_memory(&self) -> Result<()> {
        let mut tables = vec![0u8; 2 * PAGE_SIZE];
        let pdpt_gpa = KERNEL_BASE + PAGE_SIZE as u64;

        let pml4e = pdpt_gpa | pte::PRESENT | pte::RW | pte::USER;
        tables[0..8].copy_from_slice(&pml4e.to_le_bytes());

        let pdpte = pte::PRESENT | pte::RW | pte::USER | pte::PS;
        tables[PAGE_SIZE..PAGE_SIZE + 8].copy_from_slice(&pdpte.to_le_bytes());

        self.platform.map_gpa_range(
            self.partition,
            &tables,
            KERNEL_BASE,
            MemoryRegionFlags::READ | MemoryRegionFlags::WRITE,
        )?;
        info!("Kernel page tables mapped at {:#x}", KERNEL_BASE);
        Ok(())
    }

    /// Maps one page of user-space code at [`USER_CODE_BASE`]: the 3-byte
    /// privileged snippet for the host's processor vendor, read/execute.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn map_user_space(&self) -> Result<()> {
        let vendor = ProcessorVendor::from_capability(
            self.platform
                .get_capability(CapabilityCode::ProcessorVendor)?,
        );
        let snippet = match vendor {
            ProcessorVendor::Amd => VMMCALL_SNIPPET,
            ProcessorVendor::Intel => VMCALL_SNIPPET,
        };

        let mut code = vec![0u8; PAGE_SIZE];
        code[..snippet.len()].copy_from_slice(&snippet);

        self.platform.map_gpa_range(
            self.partition,
            &code,
            USER_CODE_BASE,
            MemoryRegionFlags::READ | MemoryRegionFlags::EXECUTE,
        )?;
        info!(
            "User code page mapped at {:#x} ({:?} snippet)",
            USER_CODE_BASE, vendor
        );
        Ok(())
    }

    /// Runs the VP once and dispatches the resulting exit.
    ///
    /// Guest memory is built on the first run and cached afterwards; the
    /// primed register set (instruction pointer, flags, code segment) is
    /// pushed before every run. A failure of the run primitive itself is
    /// logged and propagated without touching the register cache.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn run(&mut self) -> Result<VmExit> {
        if !self.partition.is_valid() {
            log_then_return!(MicrovisorError::InvalidPartitionHandle());
        }

        if !self.guest_memory_built {
            self.setup_kernel_memory()?;
            self.map_user_space()?;
            self.guest_memory_built = true;
        }

        self.set_specific_register(RegisterName::Rip, KERNEL_ENTRY)?;
        self.set_specific_register(RegisterName::Rflags, 0x2)?;
        self.set_specific_register(RegisterName::Cs, 0)?;
        self.set_registers()?;

        let exit = match self.platform.run_virtual_processor(self.partition, self.index) {
            Ok(exit) => exit,
            Err(e) => {
                error!("Run primitive failed for VP {}: {}", self.index, e);
                return Err(e);
            }
        };
        self.dispatch_exit(&exit);
        Ok(exit)
    }

    // Classifies one exit and performs the host-side follow-up. Emulation
    // is delegated to the emulator hooks; everything else is surfaced via
    // logging.
    fn dispatch_exit(&self, exit: &VmExit) {
        match exit {
            VmExit::Hypercall { rip, rax } => {
                info!("Hypercall at rip {:#x} with rax {:#x}", rip, rax);
            }
            VmExit::MemoryAccess {
                gpa,
                gva,
                access,
                instruction_bytes,
            } => {
                if instruction_bytes.is_empty() {
                    warn!(
                        "Memory access exit at gpa {:#x} gva {:#x} ({}) with no instruction bytes",
                        gpa, gva, access
                    );
                } else {
                    info!(
                        "Memory access exit at gpa {:#x} gva {:#x} ({}), {} instruction bytes",
                        gpa,
                        gva,
                        access,
                        instruction_bytes.len()
                    );
                    if access.contains(MemoryRegionFlags::WRITE) {
                        self.emulator.mem_write(*gpa, instruction_bytes.len(), 0);
                    } else {
                        let _ = self.emulator.mem_read(*gpa, instruction_bytes.len());
                    }
                }
            }
            VmExit::IoPortAccess {
                port,
                is_write,
                access_size,
                rax,
            } => {
                if *is_write {
                    self.emulator.io_write(*port, *access_size, *rax);
                } else {
                    let _ = self.emulator.io_read(*port, *access_size);
                }
            }
            VmExit::Halt => info!("VP {} halted", self.index),
            VmExit::Cancelled => info!("Run cancelled for VP {}", self.index),
            VmExit::Other(code) => warn!("Unhandled exit reason {:#x}", code),
        }
    }
}

impl Drop for VirtualProcessor {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn drop(&mut self) {
        if !self.partition.is_valid() {
            return;
        }
        if let Err(e) = self
            .platform
            .delete_virtual_processor(self.partition, self.index)
        {
            tracing::error!("Failed to delete virtual processor {}: {:?}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::MockPlatform;

    fn vcpu(platform: &Arc<MockPlatform>) -> VirtualProcessor {
        let partition = platform.create_ready_partition();
        VirtualProcessor::new(
            platform.clone(),
            partition,
            0,
            Arc::new(super::super::emulator::FixedEmulator),
        )
    }

    #[test]
    fn specific_register_round_trips_through_the_cache() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);

        vp.set_specific_register(RegisterName::Rax, 0xdead_beef)
            .unwrap();
        assert_eq!(
            vp.get_specific_register(RegisterName::Rax).unwrap(),
            0xdead_beef
        );
        // cache-only accessors never touch the platform
        assert_eq!(platform.call_count("get_registers"), 0);
        assert_eq!(platform.call_count("set_registers"), 0);
    }

    #[test]
    fn unknown_register_is_a_typed_error() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);

        assert!(matches!(
            vp.get_specific_register(RegisterName::InterruptState),
            Err(MicrovisorError::RegisterNotFound(_))
        ));
        assert!(matches!(
            vp.set_specific_register(RegisterName::InterruptState, 1),
            Err(MicrovisorError::RegisterNotFound(_))
        ));
    }

    #[test]
    fn save_then_restore_leaves_the_cache_unchanged() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        platform.set_register(RegisterName::Rip, 0x1234);
        platform.set_register(RegisterName::Rax, 0x42);

        vp.save_state().unwrap();
        let at_save = vp.register_values();
        vp.restore_state().unwrap();
        assert_eq!(vp.register_values(), at_save);
    }

    #[test]
    fn restore_before_save_fails_with_no_state_saved() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);

        assert!(matches!(
            vp.restore_state(),
            Err(MicrovisorError::NoStateSaved)
        ));
        assert_eq!(platform.call_count("set_registers"), 0);
    }

    #[test]
    fn failed_bulk_get_leaves_the_cache_unchanged() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        vp.set_specific_register(RegisterName::Rbx, 0x77).unwrap();

        platform.fail_next_call("get_registers");
        assert!(vp.get_registers().is_err());
        assert_eq!(vp.get_specific_register(RegisterName::Rbx).unwrap(), 0x77);
    }

    #[test]
    fn kernel_tables_and_user_code_are_mapped_once() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        platform.queue_exit(VmExit::Halt);
        platform.queue_exit(VmExit::Halt);

        vp.run().unwrap();
        vp.run().unwrap();

        let mapped = platform.mapped_regions();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].0, KERNEL_BASE);
        assert_eq!(mapped[0].1, 2 * PAGE_SIZE);
        assert_eq!(
            mapped[0].2,
            MemoryRegionFlags::READ | MemoryRegionFlags::WRITE
        );
        assert_eq!(mapped[1].0, USER_CODE_BASE);
        assert_eq!(mapped[1].1, PAGE_SIZE);
        assert_eq!(
            mapped[1].2,
            MemoryRegionFlags::READ | MemoryRegionFlags::EXECUTE
        );
    }

    #[test]
    fn page_table_bytes_encode_one_gib_identity_entry() {
        let platform = Arc::new(MockPlatform::new());
        let vp = vcpu(&platform);
        vp.setup_kernel_memory().unwrap();

        let tables = platform.mapped_bytes(KERNEL_BASE);
        let pml4e = u64::from_le_bytes(tables[0..8].try_into().unwrap());
        let pdpte = u64::from_le_bytes(tables[PAGE_SIZE..PAGE_SIZE + 8].try_into().unwrap());
        assert_eq!(
            pml4e,
            (KERNEL_BASE + PAGE_SIZE as u64) | pte::PRESENT | pte::RW | pte::USER
        );
        assert_eq!(pdpte, pte::PRESENT | pte::RW | pte::USER | pte::PS);
    }

    #[test]
    fn user_code_carries_the_amd_snippet_by_default() {
        let platform = Arc::new(MockPlatform::new());
        let vp = vcpu(&platform);
        vp.map_user_space().unwrap();

        let code = platform.mapped_bytes(USER_CODE_BASE);
        assert_eq!(&code[..3], &[0x0f, 0x01, 0xd9]);
        assert!(code[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn memory_exit_with_no_instruction_bytes_is_handled() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        vp.set_specific_register(RegisterName::Rip, 0x1000).unwrap();
        platform.queue_exit(VmExit::MemoryAccess {
            gpa: 0x2000,
            gva: 0x2000,
            access: MemoryRegionFlags::READ,
            instruction_bytes: vec![],
        });

        let exit = vp.run().unwrap();
        match exit {
            VmExit::MemoryAccess {
                gpa,
                gva,
                instruction_bytes,
                ..
            } => {
                assert_eq!(gpa, 0x2000);
                assert_eq!(gva, 0x2000);
                assert!(instruction_bytes.is_empty());
            }
            other => panic!("expected memory access exit, got {other:?}"),
        }
    }

    #[test]
    fn run_primes_the_entry_registers() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        platform.queue_exit(VmExit::Halt);

        vp.run().unwrap();
        assert_eq!(platform.register(RegisterName::Rip), KERNEL_ENTRY);
        assert_eq!(platform.register(RegisterName::Rflags), 0x2);
        assert_eq!(platform.register(RegisterName::Cs), 0);
    }

    #[test]
    fn counters_degrade_to_zero_when_unsupported() {
        let platform = Arc::new(MockPlatform::new());
        let vp = vcpu(&platform);
        platform.fail_next_call("processor_counters");

        assert_eq!(vp.processor_counters(), ProcessorCounters::default());
    }

    #[test]
    fn config_json_reports_the_stored_record() {
        let platform = Arc::new(MockPlatform::new());
        let mut vp = vcpu(&platform);
        vp.configure_vm(VmConfig {
            cpu_count: 1,
            memory_size: 0x80_0000,
            io_devices: "serial".to_string(),
        })
        .unwrap();

        let json = vp.vm_config_json().unwrap();
        assert!(json.contains("\"memory_size\": 8388608"));
        assert!(json.contains("serial"));
    }
}
