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
#![deny(dead_code, missing_docs, unused_mut)]
//! This crate contains a minimal user-mode hypervisor host. It creates a
//! partition on the host virtualization platform, attaches a virtual
//! processor, maps guest-physical memory with hand-built page tables, runs
//! guest code and dispatches the resulting VM exits.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

/// Dealing with errors arising from platform calls and VM lifecycle
pub mod error;
/// Partition, virtual processor, interrupt and snapshot management on top
/// of the virtualization platform boundary
pub mod hypervisor;
/// Guest memory: the guest-virtual to guest-physical page table and the
/// logical memory-size setting
pub mod mem;
/// The fixed architectural register catalogue and control-register
/// bit layouts
pub mod registers;
/// The hypervisor lifecycle state machine, its run-loop worker and the
/// interactive command dispatch
pub mod state;
/// Utilities for testing, including a mock virtualization platform that
/// records call counts and replays scripted failures
#[cfg(test)]
pub(crate) mod testing;

/// The re-export for the `MicrovisorError` type
pub use error::MicrovisorError;
/// The re-export for the `Platform` trait
pub use hypervisor::platform::Platform;
/// The re-export for the `VmConfig` type
pub use hypervisor::vcpu::VmConfig;
/// The re-export for the `HypervisorStateMachine` type
pub use state::machine::HypervisorStateMachine;
/// The re-export for the `HypervisorState` type
pub use state::HypervisorState;

/// The universal `Result` type used throughout the Microvisor codebase.
pub type Result<T> = core::result::Result<T, error::MicrovisorError>;

/// Logs an error then returns with it, more or less equivalent to the bail!
/// macro in anyhow but for MicrovisorError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::MicrovisorError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
        let __err_msg = std::format!($fmtstr, $($arg)*);
        let __err = $crate::error::MicrovisorError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    };
}
