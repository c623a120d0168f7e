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

use log::{error, info};
use tracing::{instrument, Span};

use super::platform::{PartitionHandle, PendingInterrupt, Platform};
use crate::registers::RegisterName;
use crate::Result;

/// Reads the two interrupt-related architectural registers and injects
/// pending interrupts into a VP.
///
/// Injection is stateless beyond holding the partition handle; it does not
/// track which vectors are pending.
#[derive(Debug)]
pub struct InterruptController {
    platform: Arc<dyn Platform>,
    partition: PartitionHandle,
    vp_index: u32,
    pending_interruption: u64,
    interrupt_state: u64,
}

impl InterruptController {
    /// Creates a controller for the VP with the given index.
    pub fn new(platform: Arc<dyn Platform>, partition: PartitionHandle, vp_index: u32) -> Self {
        Self {
            platform,
            partition,
            vp_index,
            pending_interruption: 0,
            interrupt_state: 0,
        }
    }

    /// Fetches the interrupt-state register pair into the internal cache.
    /// Fails when the partition handle is invalid or the VP does not exist
    /// yet.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn setup(&mut self) -> Result<()> {
        let values = self.platform.get_registers(
            self.partition,
            self.vp_index,
            &[
                RegisterName::PendingInterruption,
                RegisterName::InterruptState,
            ],
        )?;
        self.pending_interruption = values.first().copied().unwrap_or(0);
        self.interrupt_state = values.get(1).copied().unwrap_or(0);
        info!(
            "Interrupt controller ready: pending_interruption={:#x} interrupt_state={:#x}",
            self.pending_interruption, self.interrupt_state
        );
        Ok(())
    }

    /// Submits an edge-triggered pending interrupt with the given vector.
    /// Failure is reported once, never retried; the caller decides whether
    /// to abort the run.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn inject_interrupt(&self, vector: u32) -> Result<()> {
        let interrupt = PendingInterrupt {
            vector,
            edge_triggered: true,
        };
        match self
            .platform
            .set_pending_interrupt(self.partition, self.vp_index, interrupt)
        {
            Ok(()) => {
                info!("Injected interrupt vector {:#x}", vector);
                Ok(())
            }
            Err(e) => {
                error!("Failed to inject interrupt vector {:#x}: {}", vector, e);
                Err(e)
            }
        }
    }

    /// The cached value of the pending-interruption register.
    pub fn pending_interruption(&self) -> u64 {
        self.pending_interruption
    }

    /// The cached value of the interrupt-state register.
    pub fn interrupt_state(&self) -> u64 {
        self.interrupt_state
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InterruptController;
    use crate::registers::RegisterName;
    use crate::testing::MockPlatform;

    fn controller(platform: &Arc<MockPlatform>) -> InterruptController {
        let partition = platform.create_ready_partition();
        InterruptController::new(platform.clone(), partition, 0)
    }

    #[test]
    fn setup_caches_the_register_pair() {
        let platform = Arc::new(MockPlatform::new());
        let mut ctrl = controller(&platform);
        platform.set_register(RegisterName::PendingInterruption, 0x11);
        platform.set_register(RegisterName::InterruptState, 0x22);

        ctrl.setup().unwrap();
        assert_eq!(ctrl.pending_interruption(), 0x11);
        assert_eq!(ctrl.interrupt_state(), 0x22);
    }

    #[test]
    fn setup_fails_when_the_platform_read_fails() {
        let platform = Arc::new(MockPlatform::new());
        let mut ctrl = controller(&platform);
        platform.fail_next_call("get_registers");
        assert!(ctrl.setup().is_err());
    }

    #[test]
    fn injection_submits_an_edge_triggered_descriptor() {
        let platform = Arc::new(MockPlatform::new());
        let ctrl = controller(&platform);

        ctrl.inject_interrupt(0x30).unwrap();
        let injected = platform.injected_interrupts();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].vector, 0x30);
        assert!(injected[0].edge_triggered);
    }

    #[test]
    fn injection_failure_is_reported_not_retried() {
        let platform = Arc::new(MockPlatform::new());
        let ctrl = controller(&platform);
        platform.fail_next_call("set_pending_interrupt");

        assert!(ctrl.inject_interrupt(0x30).is_err());
        assert_eq!(platform.call_count("set_pending_interrupt"), 1);
    }
}
