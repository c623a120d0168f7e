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

use log::info;
use tracing::{instrument, Span};

use super::platform::{PartitionHandle, Platform};
use crate::{log_then_return, new_error, Result};

/// Owns the platform partition handle; the root of all downstream handle
/// lifetimes.
///
/// The handle is created at construction and deleted on drop. Processor
/// count is a partition-wide property that must be set before any VP is
/// created, so [`Partition::create_virtual_processor`] refuses to run until
/// [`Partition::setup`] has completed.
#[derive(Debug)]
pub struct Partition {
    platform: Arc<dyn Platform>,
    handle: PartitionHandle,
    setup_complete: bool,
}

impl Partition {
    /// Acquires a partition handle from the platform. Failure here is fatal
    /// to the start attempt; nothing downstream can proceed without it.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self> {
        let handle = platform.create_partition()?;
        info!("Partition created with handle {:#x}", handle.raw());
        Ok(Self {
            platform,
            handle,
            setup_complete: false,
        })
    }

    /// Sets processor-count to one and finalizes partition setup. On any
    /// platform failure the caller must not proceed to VP creation.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn setup(&mut self) -> Result<()> {
        self.platform.set_processor_count(self.handle, 1)?;
        self.platform.setup_partition(self.handle)?;
        self.setup_complete = true;
        info!("Partition setup complete");
        Ok(())
    }

    /// Creates the VP with the given index. Requires a completed setup; the
    /// platform's behavior for the reverse ordering is undefined.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_virtual_processor(&self, index: u32) -> Result<()> {
        if !self.setup_complete {
            log_then_return!(new_error!(
                "Cannot create virtual processor {}: partition setup has not completed",
                index
            ));
        }
        self.platform.create_virtual_processor(self.handle, index)?;
        info!("Virtual processor {} created", index);
        Ok(())
    }

    /// The partition handle. Valid for the partition's entire lifetime.
    pub fn handle(&self) -> PartitionHandle {
        self.handle
    }
}

impl Drop for Partition {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn drop(&mut self) {
        if !self.handle.is_valid() {
            return;
        }
        if let Err(e) = self.platform.delete_partition(self.handle) {
            tracing::error!("Failed to delete partition: {:?}", e);
        }
        self.handle = PartitionHandle::INVALID;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Partition;
    use crate::testing::MockPlatform;

    #[test]
    fn setup_orders_processor_count_before_finalize() {
        let platform = Arc::new(MockPlatform::new());
        let mut partition = Partition::new(platform.clone()).unwrap();
        partition.setup().unwrap();

        assert_eq!(platform.call_count("set_processor_count"), 1);
        assert_eq!(platform.call_count("setup_partition"), 1);
        partition.create_virtual_processor(0).unwrap();
        assert_eq!(platform.call_count("create_virtual_processor"), 1);
    }

    #[test]
    fn vp_creation_requires_setup() {
        let platform = Arc::new(MockPlatform::new());
        let partition = Partition::new(platform.clone()).unwrap();

        assert!(partition.create_virtual_processor(0).is_err());
        assert_eq!(platform.call_count("create_virtual_processor"), 0);
    }

    #[test]
    fn failed_setup_is_still_destructible() {
        let platform = Arc::new(MockPlatform::new());
        platform.fail_next_call("setup_partition");
        let mut partition = Partition::new(platform.clone()).unwrap();

        assert!(partition.setup().is_err());
        drop(partition);
        assert_eq!(platform.call_count("delete_partition"), 1);
    }

    #[test]
    fn drop_releases_the_handle_once() {
        let platform = Arc::new(MockPlatform::new());
        let partition = Partition::new(platform.clone()).unwrap();
        let handle = partition.handle();
        assert!(handle.is_valid());

        drop(partition);
        assert_eq!(platform.call_count("delete_partition"), 1);
    }
}
