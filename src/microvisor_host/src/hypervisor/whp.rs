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

use core::ffi::c_void;

use tracing::{instrument, Span};
use windows::Win32::System::Hypervisor::*;
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::platform::{
    CapabilityCode, PartitionHandle, PendingInterrupt, Platform, ProcessorCounters,
};
use super::VmExit;
use crate::mem::MemoryRegionFlags;
use crate::registers::RegisterName;
use crate::Result;

/// Interop calls for Windows Hypervisor Platform APIs
///
/// Documentation can be found at:
/// - https://learn.microsoft.com/en-us/virtualization/api/hypervisor-platform/hypervisor-platform
/// - https://microsoft.github.io/windows-docs-rs/doc/windows/Win32/System/Hypervisor/index.html
#[instrument(skip_all, parent = Span::current(), level = "Trace")]
pub fn is_hypervisor_present() -> bool {
    let mut capability: WHV_CAPABILITY = Default::default();
    let written_size: Option<*mut u32> = None;

    match unsafe {
        WHvGetCapability(
            WHvCapabilityCodeHypervisorPresent,
            &mut capability as *mut _ as *mut c_void,
            std::mem::size_of::<WHV_CAPABILITY>() as u32,
            written_size,
        )
    } {
        Ok(_) => unsafe { capability.HypervisorPresent.as_bool() },
        Err(_) => false,
    }
}

/// The Windows Hypervisor Platform backend.
#[derive(Debug, Default)]
pub struct WhpPlatform;

impl WhpPlatform {
    /// Creates the backend. The capability check happens later, through the
    /// [`Platform`] trait.
    pub fn new() -> Self {
        Self
    }
}

fn whv_handle(partition: PartitionHandle) -> WHV_PARTITION_HANDLE {
    WHV_PARTITION_HANDLE(partition.raw())
}

fn whv_register_name(name: RegisterName) -> WHV_REGISTER_NAME {
    match name {
        RegisterName::Rax => WHvX64RegisterRax,
        RegisterName::Rbx => WHvX64RegisterRbx,
        RegisterName::Rcx => WHvX64RegisterRcx,
        RegisterName::Rdx => WHvX64RegisterRdx,
        RegisterName::Rsi => WHvX64RegisterRsi,
        RegisterName::Rdi => WHvX64RegisterRdi,
        RegisterName::Rsp => WHvX64RegisterRsp,
        RegisterName::Rbp => WHvX64RegisterRbp,
        RegisterName::R8 => WHvX64RegisterR8,
        RegisterName::R9 => WHvX64RegisterR9,
        RegisterName::R10 => WHvX64RegisterR10,
        RegisterName::R11 => WHvX64RegisterR11,
        RegisterName::R12 => WHvX64RegisterR12,
        RegisterName::R13 => WHvX64RegisterR13,
        RegisterName::R14 => WHvX64RegisterR14,
        RegisterName::R15 => WHvX64RegisterR15,
        RegisterName::Rip => WHvX64RegisterRip,
        RegisterName::Rflags => WHvX64RegisterRflags,
        RegisterName::Es => WHvX64RegisterEs,
        RegisterName::Cs => WHvX64RegisterCs,
        RegisterName::Ss => WHvX64RegisterSs,
        RegisterName::Ds => WHvX64RegisterDs,
        RegisterName::Fs => WHvX64RegisterFs,
        RegisterName::Gs => WHvX64RegisterGs,
        RegisterName::Gdtr => WHvX64RegisterGdtr,
        RegisterName::Cr0 => WHvX64RegisterCr0,
        RegisterName::Cr2 => WHvX64RegisterCr2,
        RegisterName::Cr3 => WHvX64RegisterCr3,
        RegisterName::Cr4 => WHvX64RegisterCr4,
        RegisterName::Cr8 => WHvX64RegisterCr8,
        RegisterName::Efer => WHvX64RegisterEfer,
        RegisterName::Lstar => WHvX64RegisterLstar,
        RegisterName::PendingInterruption => WHvRegisterPendingInterruption,
        RegisterName::InterruptState => WHvRegisterInterruptState,
    }
}

fn whv_capability_code(code: CapabilityCode) -> WHV_CAPABILITY_CODE {
    match code {
        CapabilityCode::HypervisorPresent => WHvCapabilityCodeHypervisorPresent,
        CapabilityCode::Features => WHvCapabilityCodeFeatures,
        CapabilityCode::ExtendedVmExits => WHvCapabilityCodeExtendedVmExits,
        CapabilityCode::ExceptionExitBitmap => WHvCapabilityCodeExceptionExitBitmap,
        CapabilityCode::X64MsrExitBitmap => WHvCapabilityCodeX64MsrExitBitmap,
        CapabilityCode::ProcessorVendor => WHvCapabilityCodeProcessorVendor,
        CapabilityCode::ProcessorFeatures => WHvCapabilityCodeProcessorFeatures,
    }
}

impl Platform for WhpPlatform {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn get_capability(&self, code: CapabilityCode) -> Result<u64> {
        let mut capability: WHV_CAPABILITY = Default::default();
        unsafe {
            WHvGetCapability(
                whv_capability_code(code),
                &mut capability as *mut _ as *mut c_void,
                std::mem::size_of::<WHV_CAPABILITY>() as u32,
                None,
            )?;
        }
        let raw = unsafe {
            match code {
                CapabilityCode::HypervisorPresent => capability.HypervisorPresent.as_bool() as u64,
                CapabilityCode::Features => capability.Features.AsUINT64,
                CapabilityCode::ExtendedVmExits => capability.ExtendedVmExits.AsUINT64,
                CapabilityCode::ExceptionExitBitmap => capability.ExceptionExitBitmap,
                CapabilityCode::X64MsrExitBitmap => capability.X64MsrExitBitmap,
                CapabilityCode::ProcessorVendor => capability.ProcessorVendor.0 as u64,
                CapabilityCode::ProcessorFeatures => capability.ProcessorFeatures.AsUINT64,
            }
        };
        Ok(raw)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn create_partition(&self) -> Result<PartitionHandle> {
        let hdl = unsafe { WHvCreatePartition() }?;
        Ok(PartitionHandle::new(hdl.0))
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn delete_partition(&self, partition: PartitionHandle) -> Result<()> {
        unsafe { WHvDeletePartition(whv_handle(partition)) }?;
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn set_processor_count(&self, partition: PartitionHandle, count: u32) -> Result<()> {
        unsafe {
            WHvSetPartitionProperty(
                whv_handle(partition),
                WHvPartitionPropertyCodeProcessorCount,
                &count as *const u32 as *const c_void,
                std::mem::size_of_val(&count) as u32,
            )?;
        }
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn setup_partition(&self, partition: PartitionHandle) -> Result<()> {
        unsafe { WHvSetupPartition(whv_handle(partition)) }?;
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn create_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<()> {
        unsafe { WHvCreateVirtualProcessor(whv_handle(partition), vp_index, 0) }?;
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn delete_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<()> {
        unsafe { WHvDeleteVirtualProcessor(whv_handle(partition), vp_index) }?;
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn get_registers(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        names: &[RegisterName],
    ) -> Result<Vec<u64>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let whv_names: Vec<WHV_REGISTER_NAME> =
            names.iter().map(|name| whv_register_name(*name)).collect();
        let mut out: Vec<WHV_REGISTER_VALUE> = vec![Default::default(); names.len()];
        unsafe {
            WHvGetVirtualProcessorRegisters(
                whv_handle(partition),
                vp_index,
                whv_names.as_ptr(),
                whv_names.len() as u32,
                out.as_mut_ptr(),
            )?;
        }
        Ok(out.iter().map(|value| unsafe { value.Reg64 }).collect())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn set_registers(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        values: &[(RegisterName, u64)],
    ) -> Result<()> {
        let mut register_names: Vec<WHV_REGISTER_NAME> = vec![];
        let mut register_values: Vec<WHV_REGISTER_VALUE> = vec![];

        for (name, value) in values.iter() {
            register_names.push(whv_register_name(*name));
            register_values.push(WHV_REGISTER_VALUE { Reg64: *value });
        }

        unsafe {
            WHvSetVirtualProcessorRegisters(
                whv_handle(partition),
                vp_index,
                register_names.as_ptr(),
                register_names.len() as u32,
                register_values.as_ptr(),
            )?;
        }
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn map_gpa_range(
        &self,
        partition: PartitionHandle,
        source: &[u8],
        guest_address: u64,
        flags: MemoryRegionFlags,
    ) -> Result<()> {
        let whv_flags = flags
            .iter()
            .filter_map(|flag| match flag {
                MemoryRegionFlags::READ => Some(WHvMapGpaRangeFlagRead),
                MemoryRegionFlags::WRITE => Some(WHvMapGpaRangeFlagWrite),
                MemoryRegionFlags::EXECUTE => Some(WHvMapGpaRangeFlagExecute),
                _ => None,
            })
            .fold(WHvMapGpaRangeFlagNone, |acc, flag| acc | flag);

        unsafe {
            WHvMapGpaRange(
                whv_handle(partition),
                source.as_ptr() as *const c_void,
                guest_address,
                source.len() as u64,
                whv_flags,
            )?;
        }
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn run_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<VmExit> {
        let mut exit_context: WHV_RUN_VP_EXIT_CONTEXT = Default::default();
        unsafe {
            WHvRunVirtualProcessor(
                whv_handle(partition),
                vp_index,
                &mut exit_context as *mut _ as *mut c_void,
                std::mem::size_of::<WHV_RUN_VP_EXIT_CONTEXT>() as u32,
            )?;
        }

        let exit = match exit_context.ExitReason {
            WHvRunVpExitReasonX64IoPortAccess => {
                let io = unsafe { exit_context.Anonymous.IoPortAccess };
                let access_info = unsafe { io.AccessInfo.AsUINT32 };
                VmExit::IoPortAccess {
                    port: io.PortNumber,
                    is_write: access_info & 1 == 1,
                    access_size: ((access_info >> 1) & 0x7) as u16,
                    rax: io.Rax,
                }
            }
            WHvRunVpExitReasonMemoryAccess => {
                let mem = unsafe { exit_context.Anonymous.MemoryAccess };
                let access_info = unsafe { mem.AccessInfo.AsUINT32 };
                let access = match access_info & 0b11 {
                    0 => MemoryRegionFlags::READ,
                    1 => MemoryRegionFlags::WRITE,
                    _ => MemoryRegionFlags::EXECUTE,
                };
                let count = (mem.InstructionByteCount as usize).min(mem.InstructionBytes.len());
                VmExit::MemoryAccess {
                    gpa: mem.Gpa,
                    gva: mem.Gva,
                    access,
                    instruction_bytes: mem.InstructionBytes[..count].to_vec(),
                }
            }
            WHvRunVpExitReasonHypercall => {
                let hypercall = unsafe { exit_context.Anonymous.Hypercall };
                VmExit::Hypercall {
                    rip: exit_context.VpContext.Rip,
                    rax: hypercall.Rax,
                }
            }
            WHvRunVpExitReasonX64Halt => VmExit::Halt,
            WHvRunVpExitReasonCanceled => VmExit::Cancelled,
            other => VmExit::Other(other.0 as u32),
        };
        Ok(exit)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn set_pending_interrupt(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        interrupt: PendingInterrupt,
    ) -> Result<()> {
        // Bit layout of WHV_INTERRUPT_CONTROL: Type:8, DestinationMode:4,
        // TriggerMode:4. Fixed type and physical destination are both zero.
        let trigger: u64 = if interrupt.edge_triggered { 0 } else { 1 };
        let control = WHV_INTERRUPT_CONTROL {
            Anonymous: WHV_INTERRUPT_CONTROL_0 {
                _bitfield: trigger << 12,
            },
            Destination: vp_index,
            Vector: interrupt.vector,
        };
        unsafe {
            WHvRequestInterrupt(
                whv_handle(partition),
                &control,
                std::mem::size_of::<WHV_INTERRUPT_CONTROL>() as u32,
            )?;
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn processor_counters(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
    ) -> Result<ProcessorCounters> {
        let mut counters = WHV_PROCESSOR_RUNTIME_COUNTERS::default();
        let mut written = 0u32;
        unsafe {
            WHvGetVirtualProcessorCounters(
                whv_handle(partition),
                vp_index,
                WHvProcessorCounterSetRuntime,
                &mut counters as *mut _ as *mut c_void,
                std::mem::size_of::<WHV_PROCESSOR_RUNTIME_COUNTERS>() as u32,
                Some(&mut written),
            )?;
        }
        Ok(ProcessorCounters {
            total_runtime_100ns: counters.TotalRuntime100ns,
            hypervisor_time_100ns: counters.HypervisorTime100ns,
        })
    }
}
