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

use std::convert::Infallible;
use std::error::Error;
use std::num::TryFromIntError;
use std::sync::{MutexGuard, PoisonError};

use crossbeam_channel::{RecvError, SendError};
use thiserror::Error;

use crate::state::RunLoopCommand;

/// The error type for Microvisor operations
#[derive(Error, Debug)]
pub enum MicrovisorError {
    /// Cross beam channel receive error
    #[error("{0:?}")]
    CrossBeamReceiveError(#[from] RecvError),

    /// Cross beam channel send error
    #[error("{0:?}")]
    CrossBeamSendError(#[from] SendError<RunLoopCommand>),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// Guest execution was cancelled by the host
    #[error("Execution was cancelled by the host.")]
    ExecutionCanceledByHost(),

    /// Reading Writing or Seeking data failed.
    #[error("Reading Writing or Seeking data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// Failed to convert to Integer
    #[error("Failed To Convert Size to usize")]
    IntConversionFailure(#[from] TryFromIntError),

    /// A partition handle was used before the partition was created or after
    /// it was torn down
    #[error("The partition handle is not valid")]
    InvalidPartitionHandle(),

    /// Conversion of data to Json failed
    #[error("Conversion of data to json failed")]
    JsonConversionFailure(#[from] serde_json::Error),

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// restore_state called before any save_state succeeded
    #[error("restore_state called with no saved state")]
    NoStateSaved,

    /// A platform virtualization API call failed with the given status code
    #[error("Platform call {0} failed with status {1:#x}")]
    PlatformApiFailure(&'static str, i64),

    /// A register name outside the supported fixed register list was used
    #[error("Register {0} is not in the supported register list")]
    RegisterNotFound(String),

    /// No guest-physical translation exists for a guest-virtual address
    #[error("No translation for guest-virtual address {0:#x}")]
    TranslationFault(u64),

    /// An operation requiring a virtual processor ran before one was created
    #[error("No virtual processor has been created")]
    VirtualProcessorNotInitialized(),

    /// Windows Error
    #[cfg(target_os = "windows")]
    #[error("Windows API Error Result {0:?}")]
    WindowsAPIError(#[from] windows_result::Error),

    /// The host reported a zero page size
    #[error("Platform reported a zero page size")]
    ZeroPageSize(),
}

impl From<Infallible> for MicrovisorError {
    fn from(_: Infallible) -> Self {
        "Impossible as this is an infallible error".into()
    }
}

impl From<&str> for MicrovisorError {
    fn from(s: &str) -> Self {
        MicrovisorError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for MicrovisorError {
    // Implemented this way rather than passing the error as a source to
    // LockAttemptFailed as that would require Box<dyn Error + Send + Sync>
    // which is not easy to implement for PoisonError<MutexGuard<'_, T>>.
    // This is a good enough solution and allows us to use the ? operator on
    // lock() calls
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        MicrovisorError::LockAttemptFailed(source)
    }
}

/// Creates a `MicrovisorError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::MicrovisorError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
        let __err_msg = std::format!($fmtstr, $($arg)*);
        $crate::error::MicrovisorError::Error(__err_msg)
    }};
}
