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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::hypervisor::platform::{
    CapabilityCode, PartitionHandle, PendingInterrupt, Platform, ProcessorCounters,
};
use crate::hypervisor::VmExit;
use crate::mem::MemoryRegionFlags;
use crate::registers::RegisterName;
use crate::MicrovisorError;
use crate::Result;

/// A scriptable in-memory virtualization platform.
///
/// Records how often each platform call ran, replays queued VM exits and
/// fails calls on demand, so components can be exercised without a real
/// hypervisor underneath.
#[derive(Debug)]
pub(crate) struct MockPlatform {
    page_size: usize,
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    call_counts: HashMap<&'static str, usize>,
    fail_next: HashSet<&'static str>,
    capabilities: HashMap<CapabilityCode, u64>,
    capability_queries: usize,
    fail_capability_at: Option<usize>,
    registers: HashMap<RegisterName, u64>,
    exits: VecDeque<VmExit>,
    mapped: Vec<(u64, Vec<u8>, MemoryRegionFlags)>,
    interrupts: Vec<PendingInterrupt>,
    counters: ProcessorCounters,
    next_handle: isize,
}

fn default_capability(code: CapabilityCode) -> u64 {
    match code {
        CapabilityCode::HypervisorPresent => 1,
        _ => 0,
    }
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        Self::with_page_size(4096)
    }

    pub(crate) fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(MockState {
                next_handle: 1,
                ..MockState::default()
            }),
        }
    }

    /// How often the named platform call ran, failures included.
    pub(crate) fn call_count(&self, name: &'static str) -> usize {
        let state = self.state.lock().unwrap();
        state.call_counts.get(name).copied().unwrap_or(0)
    }

    /// Makes the next invocation of the named call fail. The call is still
    /// counted.
    pub(crate) fn fail_next_call(&self, name: &'static str) {
        let mut state = self.state.lock().unwrap();
        state.fail_next.insert(name);
    }

    /// Overrides the value a capability query reports.
    pub(crate) fn set_capability(&self, code: CapabilityCode, value: u64) {
        let mut state = self.state.lock().unwrap();
        state.capabilities.insert(code, value);
    }

    /// Makes the nth capability query fail, counted from 1.
    pub(crate) fn fail_capability_at(&self, nth: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_capability_at = Some(nth);
    }

    /// How many capability queries were issued in total.
    pub(crate) fn capability_query_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.capability_queries
    }

    /// Sets the platform-side value of one register.
    pub(crate) fn set_register(&self, name: RegisterName, value: u64) {
        let mut state = self.state.lock().unwrap();
        state.registers.insert(name, value);
    }

    /// The platform-side value of one register, zero when never written.
    pub(crate) fn register(&self, name: RegisterName) -> u64 {
        let state = self.state.lock().unwrap();
        state.registers.get(&name).copied().unwrap_or(0)
    }

    /// Queues the exit the next run call reports. An empty queue reports
    /// `Halt`.
    pub(crate) fn queue_exit(&self, exit: VmExit) {
        let mut state = self.state.lock().unwrap();
        state.exits.push_back(exit);
    }

    /// Every interrupt descriptor submitted so far, in order.
    pub(crate) fn injected_interrupts(&self) -> Vec<PendingInterrupt> {
        let state = self.state.lock().unwrap();
        state.interrupts.clone()
    }

    /// Every mapped region as (guest address, length, flags), in map order.
    pub(crate) fn mapped_regions(&self) -> Vec<(u64, usize, MemoryRegionFlags)> {
        let state = self.state.lock().unwrap();
        state
            .mapped
            .iter()
            .map(|(addr, bytes, flags)| (*addr, bytes.len(), *flags))
            .collect()
    }

    /// The bytes mapped at the given guest address, empty when nothing is
    /// mapped there.
    pub(crate) fn mapped_bytes(&self, guest_address: u64) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .mapped
            .iter()
            .find(|(addr, _, _)| *addr == guest_address)
            .map(|(_, bytes, _)| bytes.clone())
            .unwrap_or_default()
    }

    /// Hands out a valid handle without bumping any call counts, for tests
    /// that start beyond partition creation.
    pub(crate) fn create_ready_partition(&self) -> PartitionHandle {
        let mut state = self.state.lock().unwrap();
        let handle = PartitionHandle::new(state.next_handle);
        state.next_handle += 1;
        handle
    }

    // Counts the call and honors a scripted failure for it.
    fn record(&self, name: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.call_counts.entry(name).or_insert(0) += 1;
        if state.fail_next.remove(name) {
            return Err(MicrovisorError::PlatformApiFailure(name, -1));
        }
        Ok(())
    }
}

impl Platform for MockPlatform {
    fn get_capability(&self, code: CapabilityCode) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.capability_queries += 1;
        if state.fail_capability_at == Some(state.capability_queries) {
            return Err(MicrovisorError::PlatformApiFailure("get_capability", -1));
        }
        Ok(state
            .capabilities
            .get(&code)
            .copied()
            .unwrap_or_else(|| default_capability(code)))
    }

    fn create_partition(&self) -> Result<PartitionHandle> {
        self.record("create_partition")?;
        Ok(self.create_ready_partition())
    }

    fn delete_partition(&self, _partition: PartitionHandle) -> Result<()> {
        self.record("delete_partition")
    }

    fn set_processor_count(&self, _partition: PartitionHandle, _count: u32) -> Result<()> {
        self.record("set_processor_count")
    }

    fn setup_partition(&self, _partition: PartitionHandle) -> Result<()> {
        self.record("setup_partition")
    }

    fn create_virtual_processor(&self, _partition: PartitionHandle, _vp_index: u32) -> Result<()> {
        self.record("create_virtual_processor")
    }

    fn delete_virtual_processor(&self, _partition: PartitionHandle, _vp_index: u32) -> Result<()> {
        self.record("delete_virtual_processor")
    }

    fn get_registers(
        &self,
        _partition: PartitionHandle,
        _vp_index: u32,
        names: &[RegisterName],
    ) -> Result<Vec<u64>> {
        self.record("get_registers")?;
        let state = self.state.lock().unwrap();
        Ok(names
            .iter()
            .map(|name| state.registers.get(name).copied().unwrap_or(0))
            .collect())
    }

    fn set_registers(
        &self,
        _partition: PartitionHandle,
        _vp_index: u32,
        values: &[(RegisterName, u64)],
    ) -> Result<()> {
        self.record("set_registers")?;
        let mut state = self.state.lock().unwrap();
        for (name, value) in values {
            state.registers.insert(*name, *value);
        }
        Ok(())
    }

    fn map_gpa_range(
        &self,
        _partition: PartitionHandle,
        source: &[u8],
        guest_address: u64,
        flags: MemoryRegionFlags,
    ) -> Result<()> {
        self.record("map_gpa_range")?;
        let mut state = self.state.lock().unwrap();
        state.mapped.push((guest_address, source.to_vec(), flags));
        Ok(())
    }

    fn run_virtual_processor(&self, _partition: PartitionHandle, _vp_index: u32) -> Result<VmExit> {
        self.record("run_virtual_processor")?;
        let mut state = self.state.lock().unwrap();
        Ok(state.exits.pop_front().unwrap_or(VmExit::Halt))
    }

    fn set_pending_interrupt(
        &self,
        _partition: PartitionHandle,
        _vp_index: u32,
        interrupt: PendingInterrupt,
    ) -> Result<()> {
        self.record("set_pending_interrupt")?;
        let mut state = self.state.lock().unwrap();
        state.interrupts.push(interrupt);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn processor_counters(
        &self,
        _partition: PartitionHandle,
        _vp_index: u32,
    ) -> Result<ProcessorCounters> {
        self.record("processor_counters")?;
        let state = self.state.lock().unwrap();
        Ok(state.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failures_are_one_shot_and_counted() {
        let platform = MockPlatform::new();
        platform.fail_next_call("setup_partition");

        assert!(platform.setup_partition(PartitionHandle::new(1)).is_err());
        assert!(platform.setup_partition(PartitionHandle::new(1)).is_ok());
        assert_eq!(platform.call_count("setup_partition"), 2);
    }

    #[test]
    fn capability_failure_targets_the_nth_query() {
        let platform = MockPlatform::new();
        platform.fail_capability_at(2);

        assert!(platform.get_capability(CapabilityCode::HypervisorPresent).is_ok());
        assert!(platform.get_capability(CapabilityCode::Features).is_err());
        assert!(platform.get_capability(CapabilityCode::ExtendedVmExits).is_ok());
        assert_eq!(platform.capability_query_count(), 3);
    }

    #[test]
    fn run_replays_queued_exits_then_halts() {
        let platform = MockPlatform::new();
        let partition = platform.create_ready_partition();
        platform.queue_exit(VmExit::Cancelled);

        assert_eq!(
            platform.run_virtual_processor(partition, 0).unwrap(),
            VmExit::Cancelled
        );
        assert_eq!(
            platform.run_virtual_processor(partition, 0).unwrap(),
            VmExit::Halt
        );
    }
}
