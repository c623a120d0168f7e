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

use std::fmt::Debug;

use super::VmExit;
use crate::mem::MemoryRegionFlags;
use crate::registers::RegisterName;
use crate::Result;

/// An opaque handle to a platform partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionHandle(isize);

impl PartitionHandle {
    /// The never-valid handle value.
    pub const INVALID: PartitionHandle = PartitionHandle(0);

    /// Wraps a raw platform handle value.
    pub fn new(raw: isize) -> Self {
        Self(raw)
    }

    /// The raw platform handle value.
    pub fn raw(&self) -> isize {
        self.0
    }

    /// Whether this handle refers to a created partition.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// A platform capability queried during the fail-fast capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityCode {
    /// Whether a hypervisor is present on the host at all
    HypervisorPresent,
    /// The platform feature bitmap
    Features,
    /// Supported extended VM-exit reasons
    ExtendedVmExits,
    /// Which exceptions can be configured to exit
    ExceptionExitBitmap,
    /// Which MSR accesses can be configured to exit
    X64MsrExitBitmap,
    /// The processor vendor
    ProcessorVendor,
    /// The processor feature bitmap
    ProcessorFeatures,
}

/// The fixed order in which capabilities are checked; the first failing
/// query aborts the rest.
pub const CAPABILITY_CHECK_ORDER: [CapabilityCode; 7] = [
    CapabilityCode::HypervisorPresent,
    CapabilityCode::Features,
    CapabilityCode::ExtendedVmExits,
    CapabilityCode::ExceptionExitBitmap,
    CapabilityCode::X64MsrExitBitmap,
    CapabilityCode::ProcessorVendor,
    CapabilityCode::ProcessorFeatures,
];

/// The processor vendor, which selects the hypercall instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorVendor {
    /// AMD, hypercalls via vmmcall
    Amd,
    /// Intel, hypercalls via vmcall
    Intel,
}

impl ProcessorVendor {
    /// Decodes the raw value of a `ProcessorVendor` capability query.
    /// Unknown vendors fall back to Amd, matching the platform's numbering
    /// where 0 is AMD.
    pub fn from_capability(raw: u64) -> Self {
        match raw {
            1 => ProcessorVendor::Intel,
            _ => ProcessorVendor::Amd,
        }
    }
}

/// A pending-interrupt descriptor submitted to the platform's interrupt
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingInterrupt {
    /// The interrupt vector
    pub vector: u32,
    /// Whether the interrupt is edge triggered (the only mode used here)
    pub edge_triggered: bool,
}

/// Per-VP runtime counters. Platforms that cannot report them yield zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorCounters {
    /// Total guest runtime in 100 ns units
    pub total_runtime_100ns: u64,
    /// Time spent in the hypervisor in 100 ns units
    pub hypervisor_time_100ns: u64,
}

/// The opaque virtualization platform boundary.
///
/// Implementations bind whatever partition-based virtualization API the host
/// provides. Callers must respect the documented sequencing: a partition is
/// created, its processor count set and its setup finalized before any VP is
/// created on it; registers, memory mapping and run calls require an existing
/// VP. The trait is object safe so components can share one
/// `Arc<dyn Platform>`.
pub trait Platform: Send + Sync + Debug {
    /// Queries a capability, returning its raw value.
    fn get_capability(&self, code: CapabilityCode) -> Result<u64>;

    /// Creates a partition and returns its handle.
    fn create_partition(&self) -> Result<PartitionHandle>;

    /// Deletes a partition. The handle is invalid afterwards.
    fn delete_partition(&self, partition: PartitionHandle) -> Result<()>;

    /// Sets the partition-wide processor count property. Must run before
    /// partition setup is finalized.
    fn set_processor_count(&self, partition: PartitionHandle, count: u32) -> Result<()>;

    /// Finalizes partition setup. VPs can only be created after this.
    fn setup_partition(&self, partition: PartitionHandle) -> Result<()>;

    /// Creates the VP with the given index on the partition.
    fn create_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<()>;

    /// Deletes the VP with the given index.
    fn delete_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<()>;

    /// Reads the named registers in one platform call, in the given order.
    fn get_registers(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        names: &[RegisterName],
    ) -> Result<Vec<u64>>;

    /// Writes the given register values in one platform call. Either all
    /// registers transfer or none do.
    fn set_registers(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        values: &[(RegisterName, u64)],
    ) -> Result<()>;

    /// Maps host memory into the guest-physical address space with the given
    /// permissions. The platform copies or takes ownership of the backing;
    /// the host buffer is not needed after the call returns.
    fn map_gpa_range(
        &self,
        partition: PartitionHandle,
        source: &[u8],
        guest_address: u64,
        flags: MemoryRegionFlags,
    ) -> Result<()>;

    /// Runs the VP, blocking until the guest exits, and returns the
    /// classified exit.
    fn run_virtual_processor(&self, partition: PartitionHandle, vp_index: u32) -> Result<VmExit>;

    /// Submits a pending-interrupt descriptor to the VP's interrupt
    /// controller.
    fn set_pending_interrupt(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
        interrupt: PendingInterrupt,
    ) -> Result<()>;

    /// The host page size in bytes.
    fn page_size(&self) -> usize;

    /// Reads the VP's runtime counters. Platforms without counter support
    /// return an error and callers degrade to zeros.
    fn processor_counters(
        &self,
        partition: PartitionHandle,
        vp_index: u32,
    ) -> Result<ProcessorCounters>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handle_is_not_valid() {
        assert!(!PartitionHandle::INVALID.is_valid());
        assert!(PartitionHandle::new(7).is_valid());
    }

    #[test]
    fn vendor_decodes_from_capability_value() {
        assert_eq!(ProcessorVendor::from_capability(0), ProcessorVendor::Amd);
        assert_eq!(ProcessorVendor::from_capability(1), ProcessorVendor::Intel);
        assert_eq!(ProcessorVendor::from_capability(99), ProcessorVendor::Amd);
    }
}
