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

//! Register BAR access.
//!
//! A [`RegisterSpace`] is raw storage for device registers. Two implementations exist:
//! [`MmioRegion`], which maps a sysfs PCI `resourceN` file, and [`SimulatedRegisters`], a sparse
//! in-memory register file used by tests and by devices configured with `simulated = true`.
//!
//! Nothing outside this module calls a [`RegisterSpace`] directly. All accesses go through
//! [`Bar`], which rejects offsets at or past the end of the region and misaligned offsets before
//! the hardware is touched, and orders accesses with a full fence before every read and after
//! every write.

use crate::error::SlotdError;
use crate::system_io::fs_open_rw;
use log::{debug, info, trace};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Mutex, PoisonError};

/// Raw register storage.
///
/// Offsets handed to these methods have already been validated by [`Bar`]. Implementations must
/// still stay memory safe for any offset.
pub trait RegisterSpace: Send + Sync + Debug {
    /// Length of the region in bytes.
    fn len(&self) -> usize;
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    /// 64-bit read at a 4-byte aligned offset, issued as one bus transaction.
    fn read64(&self, offset: usize) -> u64;
    /// 64-bit write at a 4-byte aligned offset, issued as one bus transaction.
    ///
    /// Soft register slots sit on 4-byte boundaries and latch one indirect access per
    /// transaction, so implementations must not split the store.
    fn write64(&self, offset: usize, value: u64);
    /// A file descriptor clients can `mmap` to reach the same registers, if there is one.
    fn mapping_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// Bounds- and alignment-checked handle to a device's register region.
#[derive(Debug, Clone)]
pub struct Bar {
    space: Arc<dyn RegisterSpace>,
}

impl Bar {
    pub fn new(space: Arc<dyn RegisterSpace>) -> Bar {
        Bar { space }
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.len() == 0
    }

    pub fn mapping_fd(&self) -> Option<BorrowedFd<'_>> {
        self.space.mapping_fd()
    }

    fn check(&self, offset: usize, width: usize, align: usize) -> Result<(), SlotdError> {
        if offset % align != 0 {
            return Err(SlotdError::InvalidArgument(format!(
                "register offset {offset:#x} is not {align}-byte aligned"
            )));
        }
        match offset.checked_add(width) {
            Some(end) if end <= self.space.len() => Ok(()),
            _ => Err(SlotdError::Fault(format!(
                "register offset {offset:#x} (+{width}) is outside the {:#x} byte region",
                self.space.len()
            ))),
        }
    }

    pub fn read32(&self, offset: usize) -> Result<u32, SlotdError> {
        self.check(offset, 4, 4)?;
        fence(Ordering::SeqCst);
        let value = self.space.read32(offset);
        trace!("read32 [{offset:#x}] = {value:#010x}");
        Ok(value)
    }

    pub fn write32(&self, offset: usize, value: u32) -> Result<(), SlotdError> {
        self.check(offset, 4, 4)?;
        trace!("write32 [{offset:#x}] <- {value:#010x}");
        self.space.write32(offset, value);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// 64-bit read at a 4-byte aligned offset, as a single access.
    pub fn read64(&self, offset: usize) -> Result<u64, SlotdError> {
        self.check(offset, 8, 4)?;
        fence(Ordering::SeqCst);
        let value = self.space.read64(offset);
        trace!("read64 [{offset:#x}] = {value:#018x}");
        Ok(value)
    }

    /// 64-bit write at a 4-byte aligned offset, as a single access.
    pub fn write64(&self, offset: usize, value: u64) -> Result<(), SlotdError> {
        self.check(offset, 8, 4)?;
        trace!("write64 [{offset:#x}] <- {value:#018x}");
        self.space.write64(offset, value);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Read a feature (DFH) register. Feature registers must be 8-byte aligned.
    pub fn read_feature64(&self, offset: usize) -> Result<u64, SlotdError> {
        self.check(offset, 8, 8)?;
        self.read64(offset)
    }

    /// Write a feature (DFH) register. Feature registers must be 8-byte aligned.
    pub fn write_feature64(&self, offset: usize, value: u64) -> Result<(), SlotdError> {
        self.check(offset, 8, 8)?;
        self.write64(offset, value)
    }
}

/// A PCI BAR mapped from its sysfs `resourceN` file.
pub struct MmioRegion {
    ptr: *mut u8,
    len: usize,
    file: File,
    path: PathBuf,
}

impl Debug for MmioRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("path", &self.path)
            .finish()
    }
}

// SAFETY: the mapping is owned by this struct and lives until Drop. Moving it between threads
// does not invalidate it.
unsafe impl Send for MmioRegion {}

// SAFETY: every access is a single volatile load or store of an aligned word inside the mapping.
// Ordering between accesses is provided by the fences in `Bar`.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Map the whole of a sysfs PCI resource file.
    ///
    /// # Returns: `Result<MmioRegion, SlotdError>`
    /// * `Ok(MmioRegion)` - The mapped region
    /// * `Err(SlotdError::IORead)` - The file could not be opened, sized or mapped
    /// * `Err(SlotdError::InvalidArgument)` - The file is empty
    pub fn open(path: &Path) -> Result<MmioRegion, SlotdError> {
        let file = fs_open_rw(path)?;
        let file_len = file
            .metadata()
            .map_err(|e| SlotdError::IORead {
                file: path.into(),
                e,
            })?
            .len();
        let len = usize::try_from(file_len).map_err(|_| {
            SlotdError::InvalidArgument(format!("{path:?} is too large to map ({file_len} bytes)"))
        })?;
        if len == 0 {
            return Err(SlotdError::InvalidArgument(format!(
                "{path:?} has no length, is it a PCI resource file?"
            )));
        }

        // SAFETY: maps `len` bytes of an open resource file shared with the device. The returned
        // pointer is valid for `len` bytes until the munmap in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| SlotdError::IORead {
            file: path.into(),
            e: e.into(),
        })?;

        info!("Mapped {path:?} at {ptr:p}, {len:#x} bytes");
        Ok(MmioRegion {
            ptr: ptr.cast(),
            len,
            file,
            path: path.into(),
        })
    }

    fn in_bounds(&self, offset: usize, width: usize) -> bool {
        offset % 4 == 0 && offset.checked_add(width).is_some_and(|end| end <= self.len)
    }
}

impl RegisterSpace for MmioRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read32(&self, offset: usize) -> u32 {
        if !self.in_bounds(offset, 4) {
            return u32::MAX;
        }
        // SAFETY: offset is aligned and offset + 4 lies inside the mapping created in open().
        unsafe { self.ptr.add(offset).cast::<u32>().read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        if !self.in_bounds(offset, 4) {
            return;
        }
        // SAFETY: offset is aligned and offset + 4 lies inside the mapping created in open().
        unsafe { self.ptr.add(offset).cast::<u32>().write_volatile(value) }
    }

    fn read64(&self, offset: usize) -> u64 {
        if !self.in_bounds(offset, 8) {
            return u64::MAX;
        }
        // SAFETY: offset + 8 lies inside the mapping created in open().
        unsafe { mmio_read64(self.ptr.add(offset)) }
    }

    fn write64(&self, offset: usize, value: u64) {
        if !self.in_bounds(offset, 8) {
            return;
        }
        // SAFETY: offset + 8 lies inside the mapping created in open().
        unsafe { mmio_write64(self.ptr.add(offset), value) }
    }

    fn mapping_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.file.as_fd())
    }
}

/// One 64-bit load from device memory at a 4-byte aligned address.
///
/// # Safety
/// `ptr` must be valid for an 8 byte read.
#[cfg(target_arch = "x86_64")]
unsafe fn mmio_read64(ptr: *const u8) -> u64 {
    if ptr.cast::<u64>().is_aligned() {
        // SAFETY: aligned and valid per the caller.
        return unsafe { ptr.cast::<u64>().read_volatile() };
    }
    let value: u64;
    // SAFETY: x86 allows a misaligned `mov` from uncached memory and issues it as one access.
    unsafe {
        std::arch::asm!(
            "mov {value}, qword ptr [{addr}]",
            addr = in(reg) ptr,
            value = out(reg) value,
            options(nostack, preserves_flags, readonly),
        );
    }
    value
}

/// One 64-bit store to device memory at a 4-byte aligned address.
///
/// # Safety
/// `ptr` must be valid for an 8 byte write.
#[cfg(target_arch = "x86_64")]
unsafe fn mmio_write64(ptr: *mut u8, value: u64) {
    if ptr.cast::<u64>().is_aligned() {
        // SAFETY: aligned and valid per the caller.
        return unsafe { ptr.cast::<u64>().write_volatile(value) };
    }
    // SAFETY: as in mmio_read64.
    unsafe {
        std::arch::asm!(
            "mov qword ptr [{addr}], {value}",
            addr = in(reg) ptr,
            value = in(reg) value,
            options(nostack, preserves_flags),
        );
    }
}

// Other targets fault on misaligned 64-bit device accesses, so they get two 32-bit ones.
#[cfg(not(target_arch = "x86_64"))]
unsafe fn mmio_read64(ptr: *const u8) -> u64 {
    if ptr.cast::<u64>().is_aligned() {
        // SAFETY: aligned and valid per the caller.
        return unsafe { ptr.cast::<u64>().read_volatile() };
    }
    // SAFETY: both halves are 4-byte aligned and inside the caller's 8 bytes.
    let (low, high) = unsafe {
        (
            ptr.cast::<u32>().read_volatile(),
            ptr.add(4).cast::<u32>().read_volatile(),
        )
    };
    u64::from(high) << 32 | u64::from(low)
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn mmio_write64(ptr: *mut u8, value: u64) {
    if ptr.cast::<u64>().is_aligned() {
        // SAFETY: aligned and valid per the caller.
        return unsafe { ptr.cast::<u64>().write_volatile(value) };
    }
    // SAFETY: both halves are 4-byte aligned and inside the caller's 8 bytes.
    unsafe {
        ptr.cast::<u32>().write_volatile(value as u32);
        ptr.add(4).cast::<u32>().write_volatile((value >> 32) as u32);
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and len are exactly what mmap returned in open() and nothing borrows the
        // mapping past the lifetime of self.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            debug!("munmap of {:?} failed: {e}", self.path);
        }
    }
}

/// A sparse, in-memory register file.
///
/// Unwritten registers read as zero. Every write is also appended to a log so callers can check
/// the order in which registers were programmed.
#[derive(Debug)]
pub struct SimulatedRegisters {
    len: usize,
    words: Mutex<HashMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u64)>>,
}

impl SimulatedRegisters {
    pub fn new(len: usize) -> SimulatedRegisters {
        SimulatedRegisters {
            len,
            words: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Set a 32-bit register without recording a write.
    pub fn poke32(&self, offset: usize, value: u32) {
        self.words
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offset & !3, value);
    }

    /// Set a 64-bit register without recording a write.
    pub fn poke64(&self, offset: usize, value: u64) {
        self.poke32(offset, value as u32);
        self.poke32(offset + 4, (value >> 32) as u32);
    }

    pub fn peek32(&self, offset: usize) -> u32 {
        self.words
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(offset & !3))
            .copied()
            .unwrap_or(0)
    }

    pub fn peek64(&self, offset: usize) -> u64 {
        u64::from(self.peek32(offset + 4)) << 32 | u64::from(self.peek32(offset))
    }

    /// Every `(offset, value)` written through the [`RegisterSpace`] interface, oldest first.
    pub fn write_log(&self) -> Vec<(usize, u64)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, offset: usize, value: u64) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((offset, value));
    }
}

impl RegisterSpace for SimulatedRegisters {
    fn len(&self) -> usize {
        self.len
    }

    fn read32(&self, offset: usize) -> u32 {
        self.peek32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.record(offset, u64::from(value));
        self.poke32(offset, value);
    }

    fn read64(&self, offset: usize) -> u64 {
        self.peek64(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.record(offset, value);
        self.poke64(offset, value);
    }

    fn mapping_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    fn simulated_bar(len: usize) -> (Arc<SimulatedRegisters>, Bar) {
        let regs = Arc::new(SimulatedRegisters::new(len));
        (regs.clone(), Bar::new(regs))
    }

    #[gtest]
    fn unwritten_registers_read_zero() {
        let (_, bar) = simulated_bar(0x100);
        expect_that!(bar.read32(0x10), ok(eq(&0)));
        expect_that!(bar.read64(0x18), ok(eq(&0)));
    }

    #[gtest]
    #[rstest]
    #[case::at_end(0x100)]
    #[case::past_end(0x200)]
    #[case::overflowing(usize::MAX - 3)]
    fn rejects_out_of_bounds(#[case] offset: usize) {
        let (regs, bar) = simulated_bar(0x100);
        expect_that!(
            bar.read32(offset),
            err(displays_as(contains_substring("SlotdError::Fault")))
        );
        expect_that!(bar.write32(offset, 1), err(anything()));
        expect_that!(regs.write_log(), is_empty());
    }

    #[gtest]
    fn read64_past_end_is_a_fault() {
        let (_, bar) = simulated_bar(0x100);
        expect_that!(
            bar.read64(0xfc),
            err(displays_as(contains_substring("SlotdError::Fault")))
        );
    }

    #[gtest]
    #[rstest]
    #[case::two(0x12)]
    #[case::one(0x11)]
    fn rejects_misaligned_32(#[case] offset: usize) {
        let (_, bar) = simulated_bar(0x100);
        expect_that!(
            bar.read32(offset),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    fn feature_registers_must_be_eight_byte_aligned() {
        let (regs, bar) = simulated_bar(0x100);
        regs.poke64(0x10, 0xdead_beef_0000_0001);
        expect_that!(bar.read_feature64(0x10), ok(eq(&0xdead_beef_0000_0001)));
        expect_that!(
            bar.read_feature64(0x14),
            err(displays_as(contains_substring("8-byte aligned")))
        );
        expect_that!(bar.write_feature64(0x0c, 1), err(anything()));
        expect_that!(regs.write_log(), is_empty());
    }

    #[gtest]
    fn unaligned_64_bit_access_is_one_transaction() {
        let (regs, bar) = simulated_bar(0x100);
        bar.write64(0x24, 0x1111_2222_3333_4444)
            .expect("write inside the region");
        expect_that!(regs.peek32(0x24), eq(0x3333_4444));
        expect_that!(regs.peek32(0x28), eq(0x1111_2222));
        expect_that!(
            regs.write_log(),
            elements_are![eq(&(0x24, 0x1111_2222_3333_4444))]
        );
        expect_that!(bar.read64(0x24), ok(eq(&0x1111_2222_3333_4444)));
    }

    #[gtest]
    fn simulated_region_has_no_mapping_fd() {
        let (_, bar) = simulated_bar(0x100);
        expect_that!(bar.mapping_fd().is_none(), eq(true));
    }

    #[gtest]
    fn mmio_region_open_missing_file() {
        expect_that!(
            MmioRegion::open(Path::new("/nonexistent/resource0")).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::IORead")))
        );
    }
}
