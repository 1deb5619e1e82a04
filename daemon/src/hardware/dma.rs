// This file is part of slotd, an application to share the DMA slots of an FPGA accelerator between cooperating processes.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// slotd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// slotd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! DMA-capable host memory.
//!
//! Buffers are backed by a memfd so that the same pages can be mapped by the daemon and handed to
//! a client as a file descriptor. Each buffer is page aligned, locked in memory when the process
//! is allowed to, and carries the bus address the card must be programmed with.
//!
//! A bus address only reaches the buffer when an [`IommuMapping`] has mapped it. Allocators
//! without one hand out addresses that no device can use, which is fine for simulated devices
//! and nothing else. [`DmaAllocator::device_visible`] tells the two apart.

use crate::error::SlotdError;
use log::{debug, error, warn};
use rustix::fs::{MemfdFlags, ftruncate, memfd_create};
use rustix::mm::{MapFlags, ProtFlags, mlock, mmap, munlock, munmap};
use std::fmt::Debug;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const PAGE_SIZE: usize = 4096;

/// First bus address handed out by [`HostDmaAllocator`].
pub const IOVA_BASE: u64 = 0x1_0000_0000;

/// Something that can hand out DMA buffers for one device.
pub trait DmaAllocator: Send + Sync + Debug {
    fn allocate(&self, len: usize) -> Result<DmaBuffer, SlotdError>;
    /// Whether a real card can reach the buffers at their bus addresses.
    fn device_visible(&self) -> bool;
}

/// An IOMMU address space the card's DMA is translated through.
pub trait IommuMapping: Send + Sync + Debug {
    /// Make `len` bytes of this process's memory at `vaddr` visible to the card at `iova`.
    fn map(&self, vaddr: u64, iova: u64, len: u64) -> Result<(), SlotdError>;
    fn unmap(&self, iova: u64, len: u64) -> Result<(), SlotdError>;
}

/// Counts the buffers an allocator currently has outstanding.
#[derive(Debug, Default)]
pub struct DmaStats {
    buffers: AtomicUsize,
    bytes: AtomicUsize,
}

impl DmaStats {
    pub fn live_buffers(&self) -> usize {
        self.buffers.load(Ordering::Acquire)
    }

    pub fn live_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}

/// A page-aligned, memfd-backed buffer the card can DMA into.
pub struct DmaBuffer {
    ptr: *mut u8,
    len: usize,
    bus_address: u64,
    locked: bool,
    file: File,
    stats: Arc<DmaStats>,
    iommu: Option<Arc<dyn IommuMapping>>,
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("bus_address", &format_args!("{:#x}", self.bus_address))
            .field("locked", &self.locked)
            .field("iommu", &self.iommu.is_some())
            .finish()
    }
}

// SAFETY: the buffer exclusively owns its mapping until Drop; the mapping is process-wide.
unsafe impl Send for DmaBuffer {}

// SAFETY: the daemon never dereferences the mapping through a shared reference. The contents
// are only touched by the card and by the owning client through its own mapping.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn bus_address(&self) -> u64 {
        self.bus_address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The memfd backing the buffer, for clients that map it.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // The card must lose access before the pages go back to the kernel.
        if let Some(iommu) = &self.iommu {
            if let Err(e) = iommu.unmap(self.bus_address, self.len as u64) {
                error!("Failed to unmap DMA buffer at {:#x} from the IOMMU: {e}", self.bus_address);
            }
        }
        if self.locked {
            // SAFETY: the range was locked in HostDmaAllocator::allocate and is still mapped.
            let _ = unsafe { munlock(self.ptr.cast(), self.len) };
        }
        // SAFETY: ptr and len are what mmap returned; no references into the mapping remain.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            warn!("Failed to unmap DMA buffer at {:#x}: {e}", self.bus_address);
        }
        self.stats.buffers.fetch_sub(1, Ordering::AcqRel);
        self.stats.bytes.fetch_sub(self.len, Ordering::AcqRel);
        debug!("Freed DMA buffer at bus address {:#x}", self.bus_address);
    }
}

/// Allocates memfd-backed buffers with IOVA-style bus addresses.
///
/// With an [`IommuMapping`] every buffer is mapped at its bus address before it is handed out.
/// An optional byte budget caps the total size of live buffers, mirroring a locked-memory limit.
#[derive(Debug)]
pub struct HostDmaAllocator {
    next_iova: AtomicU64,
    budget: Option<usize>,
    stats: Arc<DmaStats>,
    iommu: Option<Arc<dyn IommuMapping>>,
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        HostDmaAllocator::new()
    }
}

impl HostDmaAllocator {
    pub fn new() -> HostDmaAllocator {
        HostDmaAllocator {
            next_iova: AtomicU64::new(IOVA_BASE),
            budget: None,
            stats: Arc::new(DmaStats::default()),
            iommu: None,
        }
    }

    /// An allocator whose buffers are mapped into `iommu`.
    pub fn with_iommu(iommu: Arc<dyn IommuMapping>) -> HostDmaAllocator {
        HostDmaAllocator {
            iommu: Some(iommu),
            ..HostDmaAllocator::new()
        }
    }

    /// An allocator that refuses to keep more than `bytes` bytes alive at once.
    pub fn with_budget(bytes: usize) -> HostDmaAllocator {
        HostDmaAllocator {
            budget: Some(bytes),
            ..HostDmaAllocator::new()
        }
    }

    pub fn stats(&self) -> Arc<DmaStats> {
        self.stats.clone()
    }

    fn reserve(&self, len: usize) -> Result<(), SlotdError> {
        let reserved = self.stats.bytes.fetch_add(len, Ordering::AcqRel);
        let over_budget = self
            .budget
            .is_some_and(|budget| reserved.saturating_add(len) > budget);
        if let (true, Some(budget)) = (over_budget, self.budget) {
            self.stats.bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(SlotdError::DmaAllocation {
                len,
                reason: format!("{reserved} of {budget} budgeted bytes already in use"),
            });
        }
        Ok(())
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn allocate(&self, len: usize) -> Result<DmaBuffer, SlotdError> {
        if len == 0 {
            return Err(SlotdError::InvalidArgument(
                "DMA buffers cannot be empty".to_string(),
            ));
        }
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let failed = |reason: String| SlotdError::DmaAllocation { len, reason };

        self.reserve(len)?;
        let release_reservation = || {
            self.stats.bytes.fetch_sub(len, Ordering::AcqRel);
        };

        let file = match memfd_create("slotd-dma", MemfdFlags::CLOEXEC)
            .map(File::from)
            .and_then(|file| ftruncate(&file, len as u64).map(|_| file))
        {
            Ok(file) => file,
            Err(e) => {
                release_reservation();
                return Err(failed(format!("memfd: {e}")));
            }
        };

        // SAFETY: maps the whole of the memfd created above, which is exactly len bytes long.
        let ptr = match unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        } {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(e) => {
                release_reservation();
                return Err(failed(format!("mmap: {e}")));
            }
        };

        // SAFETY: ptr is valid for len bytes, just mapped above.
        let locked = match unsafe { mlock(ptr.cast(), len) } {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not lock {len} bytes of DMA memory, continuing unlocked: {e}");
                false
            }
        };

        let bus_address = self.next_iova.fetch_add(len as u64, Ordering::AcqRel);
        if let Some(iommu) = &self.iommu {
            if let Err(e) = iommu.map(ptr as u64, bus_address, len as u64) {
                // SAFETY: the mapping was created above and has not been shared.
                unsafe {
                    if locked {
                        let _ = munlock(ptr.cast(), len);
                    }
                    let _ = munmap(ptr.cast(), len);
                }
                release_reservation();
                return Err(failed(format!("IOMMU mapping at {bus_address:#x}: {e}")));
            }
        }
        self.stats.buffers.fetch_add(1, Ordering::AcqRel);
        debug!("Allocated {len:#x} byte DMA buffer at bus address {bus_address:#x}");

        Ok(DmaBuffer {
            ptr,
            len,
            bus_address,
            locked,
            file,
            stats: self.stats.clone(),
            iommu: self.iommu.clone(),
        })
    }

    fn device_visible(&self) -> bool {
        self.iommu.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use std::sync::Mutex;

    #[gtest]
    fn buffers_are_page_sized_with_distinct_bus_addresses() {
        let allocator = HostDmaAllocator::new();
        let a = allocator.allocate(100).expect("allocation");
        let b = allocator.allocate(PAGE_SIZE).expect("allocation");
        expect_that!(a.len(), eq(PAGE_SIZE));
        expect_that!(a.bus_address(), eq(IOVA_BASE));
        expect_that!(b.bus_address(), eq(IOVA_BASE + PAGE_SIZE as u64));
        expect_that!(allocator.stats().live_buffers(), eq(2));
    }

    #[gtest]
    fn dropping_a_buffer_releases_it() {
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        let buffer = allocator.allocate(3 * PAGE_SIZE).expect("allocation");
        expect_that!(stats.live_bytes(), eq(3 * PAGE_SIZE));
        drop(buffer);
        expect_that!(stats.live_buffers(), eq(0));
        expect_that!(stats.live_bytes(), eq(0));
    }

    #[gtest]
    fn budget_is_enforced() {
        let allocator = HostDmaAllocator::with_budget(2 * PAGE_SIZE);
        let _first = allocator.allocate(PAGE_SIZE).expect("within budget");
        let _second = allocator.allocate(PAGE_SIZE).expect("within budget");
        expect_that!(
            allocator.allocate(PAGE_SIZE).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::DmaAllocation")))
        );
        expect_that!(allocator.stats().live_bytes(), eq(2 * PAGE_SIZE));
    }

    #[derive(Debug, Default)]
    struct RecordingIommu {
        fail: bool,
        mapped: Mutex<Vec<(u64, u64)>>,
        unmapped: Mutex<Vec<(u64, u64)>>,
    }

    impl IommuMapping for RecordingIommu {
        fn map(&self, _vaddr: u64, iova: u64, len: u64) -> Result<(), SlotdError> {
            if self.fail {
                return Err(SlotdError::Internal("no IOMMU".to_string()));
            }
            self.mapped.lock().expect("lock").push((iova, len));
            Ok(())
        }

        fn unmap(&self, iova: u64, len: u64) -> Result<(), SlotdError> {
            self.unmapped.lock().expect("lock").push((iova, len));
            Ok(())
        }
    }

    #[gtest]
    fn host_only_buffers_are_not_device_visible() {
        expect_that!(HostDmaAllocator::new().device_visible(), eq(false));
    }

    #[gtest]
    fn iommu_buffers_are_mapped_at_their_bus_address_until_dropped() {
        let iommu = Arc::new(RecordingIommu::default());
        let allocator = HostDmaAllocator::with_iommu(iommu.clone());
        expect_that!(allocator.device_visible(), eq(true));

        let buffer = allocator.allocate(PAGE_SIZE).expect("allocation");
        expect_that!(
            *iommu.mapped.lock().expect("lock"),
            elements_are![eq(&(buffer.bus_address(), PAGE_SIZE as u64))]
        );
        expect_that!(*iommu.unmapped.lock().expect("lock"), is_empty());

        let bus_address = buffer.bus_address();
        drop(buffer);
        expect_that!(
            *iommu.unmapped.lock().expect("lock"),
            elements_are![eq(&(bus_address, PAGE_SIZE as u64))]
        );
    }

    #[gtest]
    fn failed_iommu_mapping_frees_the_buffer() {
        let iommu = Arc::new(RecordingIommu {
            fail: true,
            ..RecordingIommu::default()
        });
        let allocator = HostDmaAllocator::with_iommu(iommu);
        expect_that!(
            allocator.allocate(PAGE_SIZE).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::DmaAllocation")))
        );
        expect_that!(allocator.stats().live_buffers(), eq(0));
        expect_that!(allocator.stats().live_bytes(), eq(0));
    }

    #[gtest]
    fn empty_buffers_are_rejected() {
        expect_that!(
            HostDmaAllocator::new().allocate(0).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }
}
