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

use crate::hypervisor::vcpu::VmConfig;

/// The hypervisor lifecycle state machine and its run-loop worker
pub mod machine;

/// The lifecycle state of the hypervisor.
///
/// `Initializing` goes to `Ready` when the capability check passes, `Ready`
/// to `Running` when partition and component initialization succeed, and
/// `Running` to `Stopped` when the run loop exits. Any failure along the way
/// lands in `Error`, which is terminal for that attempt; a fresh start
/// re-enters `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorState {
    /// Capability checks are in progress
    Initializing,
    /// The platform is capable; partition setup may proceed
    Ready,
    /// The run loop is executing guest code
    Running,
    /// The run loop has exited
    Stopped,
    /// A start or run attempt failed
    Error,
}

impl fmt::Display for HypervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HypervisorState::Initializing => "Initializing",
            HypervisorState::Ready => "Ready",
            HypervisorState::Running => "Running",
            HypervisorState::Stopped => "Stopped",
            HypervisorState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// One action on the interactive command surface. CLI and GUI frontends both
/// funnel into the same dispatch with these.
#[derive(Debug, Clone, PartialEq)]
pub enum MenuOption {
    /// Start the run loop
    Start,
    /// Stop the run loop
    Stop,
    /// Restore saved state in the running loop
    Restart,
    /// Capture the VP's registers into the single snapshot slot
    SaveSnapshot,
    /// Push the snapshot slot back to the platform
    RestoreSnapshot,
    /// Refresh and render the full register cache
    DumpRegisters,
    /// Push the register cache to the platform
    SetRegisters,
    /// Refresh the register cache from the platform
    GetRegisters,
    /// Change the logical memory size and rebuild the page table
    SetMemorySize(u64),
    /// Read a single named register
    GetSpecificRegister(String),
    /// Write a single named register
    SetSpecificRegister(String, u64),
    /// Apply a VM configuration record
    ConfigureVm(VmConfig),
    /// Report the VM configuration as JSON
    GetVmConfig,
    /// Stop everything and shut the worker down
    Quit,
}

/// A message to the long-lived run-loop worker. One worker consumes these
/// for the whole process lifetime; Start never spawns a second loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLoopCommand {
    /// Begin executing run cycles
    Start,
    /// Out-of-band no-op: keep running
    Continue,
    /// Restore the VP's saved state and keep running
    Restart,
    /// Leave the run loop
    Stop,
    /// Terminate the worker thread
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::HypervisorState;

    #[test]
    fn states_render_by_name() {
        assert_eq!(HypervisorState::Initializing.to_string(), "Initializing");
        assert_eq!(HypervisorState::Ready.to_string(), "Ready");
        assert_eq!(HypervisorState::Running.to_string(), "Running");
        assert_eq!(HypervisorState::Stopped.to_string(), "Stopped");
        assert_eq!(HypervisorState::Error.to_string(), "Error");
    }
}
