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

use std::sync::Arc;

use log::{info, warn};
use tracing::{instrument, Span};

use super::platform::{PartitionHandle, Platform};
use super::vcpu::VirtualProcessor;
use crate::registers::{RegisterName, REGISTER_COUNT, REGISTER_NAMES};
use crate::Result;

/// Single-slot capture/restore of a VP's full register set.
///
/// Each save overwrites the previous snapshot. Restoring with no snapshot
/// taken is a warning and a no-op, never an error.
#[derive(Debug)]
pub struct SnapshotManager {
    platform: Arc<dyn Platform>,
    partition: PartitionHandle,
    vp_index: u32,
    snapshot: Option<[u64; REGISTER_COUNT]>,
}

impl SnapshotManager {
    /// Creates a manager for the VP with the given index.
    pub fn new(platform: Arc<dyn Platform>, partition: PartitionHandle, vp_index: u32) -> Self {
        Self {
            platform,
            partition,
            vp_index,
            snapshot: None,
        }
    }

    /// Sanity-probes the platform register-read path with an empty register
    /// list: validates partition/VP reachability without side effects.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn initialize(&self) -> Result<()> {
        self.platform
            .get_registers(self.partition, self.vp_index, &[])?;
        Ok(())
    }

    /// Captures the VP's live register cache, refreshing it from the
    /// platform first so the snapshot reflects current guest state.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn save_snapshot(&mut self, vcpu: &mut VirtualProcessor) -> Result<()> {
        vcpu.get_registers()?;
        self.snapshot = Some(vcpu.register_values());
        info!("Snapshot saved for VP {}", self.vp_index);
        Ok(())
    }

    /// Pushes the saved snapshot back to the platform with the same bulk
    /// register call used elsewhere. Warns and does nothing when no
    /// snapshot exists.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn restore_snapshot(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            warn!("No snapshot to restore for VP {}", self.vp_index);
            return Ok(());
        };
        let values: Vec<(RegisterName, u64)> = REGISTER_NAMES
            .iter()
            .zip(snapshot.iter())
            .map(|(name, value)| (*name, *value))
            .collect();
        self.platform
            .set_registers(self.partition, self.vp_index, &values)?;
        info!("Snapshot restored for VP {}", self.vp_index);
        Ok(())
    }

    /// Whether a snapshot has been taken.
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SnapshotManager;
    use crate::hypervisor::emulator::FixedEmulator;
    use crate::hypervisor::vcpu::VirtualProcessor;
    use crate::registers::RegisterName;
    use crate::testing::MockPlatform;

    fn manager_and_vcpu(platform: &Arc<MockPlatform>) -> (SnapshotManager, VirtualProcessor) {
        let partition = platform.create_ready_partition();
        let mgr = SnapshotManager::new(platform.clone(), partition, 0);
        let vp = VirtualProcessor::new(platform.clone(), partition, 0, Arc::new(FixedEmulator));
        (mgr, vp)
    }

    #[test]
    fn restore_with_no_snapshot_is_a_warned_noop() {
        let platform = Arc::new(MockPlatform::new());
        let (mgr, _vp) = manager_and_vcpu(&platform);

        mgr.restore_snapshot().unwrap();
        assert_eq!(platform.call_count("set_registers"), 0);
        assert!(!mgr.has_snapshot());
    }

    #[test]
    fn save_captures_live_platform_state() {
        let platform = Arc::new(MockPlatform::new());
        let (mut mgr, mut vp) = manager_and_vcpu(&platform);
        platform.set_register(RegisterName::Rax, 0x1111);

        mgr.save_snapshot(&mut vp).unwrap();
        assert!(mgr.has_snapshot());

        platform.set_register(RegisterName::Rax, 0x2222);
        mgr.restore_snapshot().unwrap();
        assert_eq!(platform.register(RegisterName::Rax), 0x1111);
    }

    #[test]
    fn save_overwrites_the_single_slot() {
        let platform = Arc::new(MockPlatform::new());
        let (mut mgr, mut vp) = manager_and_vcpu(&platform);

        platform.set_register(RegisterName::Rbx, 0xaa);
        mgr.save_snapshot(&mut vp).unwrap();
        platform.set_register(RegisterName::Rbx, 0xbb);
        mgr.save_snapshot(&mut vp).unwrap();

        platform.set_register(RegisterName::Rbx, 0);
        mgr.restore_snapshot().unwrap();
        assert_eq!(platform.register(RegisterName::Rbx), 0xbb);
    }

    #[test]
    fn initialize_probes_the_register_path() {
        let platform = Arc::new(MockPlatform::new());
        let (mgr, _vp) = manager_and_vcpu(&platform);

        mgr.initialize().unwrap();
        assert_eq!(platform.call_count("get_registers"), 1);

        platform.fail_next_call("get_registers");
        assert!(mgr.initialize().is_err());
    }
}
