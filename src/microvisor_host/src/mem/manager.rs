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

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use tracing::{instrument, Span};

use crate::error::MicrovisorError;
use crate::hypervisor::platform::Platform;
use crate::Result;

/// Tracks the logical guest memory size and a flat guest-virtual to
/// guest-physical lookup table populated at page granularity.
///
/// The table is a pre-populated identity map, not a walk of the guest's real
/// paging structures. The stored memory size and the table are deliberately
/// decoupled: [`MemoryManager::update_memory_size`] only changes the size,
/// and callers that need a consistent table afterwards must call
/// [`MemoryManager::initialize`] again.
#[derive(Debug)]
pub struct MemoryManager {
    platform: Arc<dyn Platform>,
    memory_size: u64,
    page_table: BTreeMap<u64, u64>,
}

impl MemoryManager {
    /// Creates a manager for the given logical memory size. The page table
    /// is empty until [`MemoryManager::initialize`] runs.
    pub fn new(platform: Arc<dyn Platform>, memory_size: u64) -> Self {
        Self {
            platform,
            memory_size,
            page_table: BTreeMap::new(),
        }
    }

    /// Rebuilds the page table: one identity entry per host page from 0 up
    /// to the configured memory size. Every key is a multiple of the host
    /// page size.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn initialize(&mut self) -> Result<()> {
        let page_size = self.platform.page_size() as u64;
        if page_size == 0 {
            return Err(MicrovisorError::ZeroPageSize());
        }

        self.page_table.clear();
        let mut gva = 0;
        while gva < self.memory_size {
            self.page_table.insert(gva, gva);
            gva += page_size;
        }

        info!(
            "Memory manager initialized: {} pages of {} bytes covering {:#x} bytes",
            self.page_table.len(),
            page_size,
            self.memory_size
        );
        Ok(())
    }

    /// Exact-match translation of a page-aligned guest-virtual address.
    pub fn translate(&self, gva: u64) -> Result<u64> {
        match self.page_table.get(&gva) {
            Some(gpa) => Ok(*gpa),
            None => Err(MicrovisorError::TranslationFault(gva)),
        }
    }

    /// Stores a new logical memory size without touching the page table.
    pub fn update_memory_size(&mut self, new_size: u64) {
        debug!(
            "Memory size updated from {:#x} to {:#x} (table not rebuilt)",
            self.memory_size, new_size
        );
        self.memory_size = new_size;
    }

    /// The configured logical memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Approximates usage as `page_size * populated_entries`. This is not a
    /// measure of actually-touched guest memory.
    pub fn current_usage(&self) -> u64 {
        self.platform.page_size() as u64 * self.page_table.len() as u64
    }

    /// The number of populated page-table entries.
    pub fn entry_count(&self) -> usize {
        self.page_table.len()
    }
}
