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

//! Slot ownership.
//!
//! A device has a fixed number of slots, each either free or reserved by one process. The
//! reservation bitmap and the owner table are kept together under one lock so that a set bit
//! always has an owner and a clear bit never does. The lock is held only for the bitmap update,
//! never across register access or a wait.

use crate::error::SlotdError;
use log::{debug, warn};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};

pub const MIN_SLOT_COUNT: u32 = 2;
pub const MAX_SLOT_COUNT: u32 = 256;

/// A slot count in `MIN_SLOT_COUNT..=MAX_SLOT_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCount(u32);

impl SlotCount {
    pub fn new(count: u32) -> Result<SlotCount, SlotdError> {
        if (MIN_SLOT_COUNT..=MAX_SLOT_COUNT).contains(&count) {
            Ok(SlotCount(count))
        } else {
            Err(SlotdError::InvalidArgument(format!(
                "slot count {count} is outside {MIN_SLOT_COUNT}..={MAX_SLOT_COUNT}"
            )))
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// A slot index known to be below the device's slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u8);

impl SlotId {
    pub fn new(index: u32, count: SlotCount) -> Result<SlotId, SlotdError> {
        if index < count.get() {
            // count <= 256, so index fits in a u8
            Ok(SlotId(index as u8))
        } else {
            Err(SlotdError::InvalidArgument(format!(
                "slot {index} does not exist, the device has {} slots",
                count.get()
            )))
        }
    }

    pub fn index(&self) -> usize {
        usize::from(self.0)
    }

    pub fn get(&self) -> u32 {
        u32::from(self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process identity that owns slots. Zero is never a valid owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(NonZeroU32);

impl Pid {
    pub fn new(pid: u32) -> Result<Pid, SlotdError> {
        NonZeroU32::new(pid)
            .map(Pid)
            .ok_or_else(|| SlotdError::InvalidArgument("process id 0 cannot own slots".into()))
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a range request lays out its slots. Only contiguous ranges are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeType {
    Invalid = 0,
    Contiguous = 1,
    Discontiguous = 2,
}

impl From<u32> for RangeType {
    fn from(raw: u32) -> Self {
        match raw {
            1 => RangeType::Contiguous,
            2 => RangeType::Discontiguous,
            _ => RangeType::Invalid,
        }
    }
}

#[derive(Debug)]
struct SlotState {
    bitmap: Vec<u64>,
    owners: Vec<Option<Pid>>,
}

impl SlotState {
    fn is_set(&self, i: usize) -> bool {
        self.bitmap[i / 64] & (1 << (i % 64)) != 0
    }

    fn reserve(&mut self, i: usize, pid: Pid) {
        self.bitmap[i / 64] |= 1 << (i % 64);
        self.owners[i] = Some(pid);
    }

    fn free(&mut self, i: usize) {
        self.bitmap[i / 64] &= !(1 << (i % 64));
        self.owners[i] = None;
    }

    fn owned_by(&self, pid: Pid) -> Vec<usize> {
        (0..self.owners.len())
            .filter(|&i| self.is_set(i) && self.owners[i] == Some(pid))
            .collect()
    }
}

#[derive(Debug)]
pub struct SlotTable {
    count: SlotCount,
    state: Mutex<SlotState>,
}

impl SlotTable {
    pub fn new(count: SlotCount) -> SlotTable {
        let n = count.get() as usize;
        SlotTable {
            count,
            state: Mutex::new(SlotState {
                bitmap: vec![0; n.div_ceil(64)],
                owners: vec![None; n],
            }),
        }
    }

    pub fn count(&self) -> SlotCount {
        self.count
    }

    fn state(&self) -> Result<MutexGuard<'_, SlotState>, SlotdError> {
        self.state
            .lock()
            .map_err(|_| SlotdError::Internal("slot table lock poisoned".into()))
    }

    fn slot(&self, i: usize) -> SlotId {
        SlotId(i as u8)
    }

    /// Reserve the lowest free slot for `pid`.
    pub fn acquire_one(&self, pid: Pid) -> Result<SlotId, SlotdError> {
        let mut state = self.state()?;
        let free = (0..self.count.get() as usize).find(|&i| !state.is_set(i));
        match free {
            Some(i) => {
                state.reserve(i, pid);
                debug!("Slot {i} reserved by {pid}");
                Ok(self.slot(i))
            }
            None => Err(SlotdError::ResourceExhausted(format!(
                "all {} slots are reserved",
                self.count.get()
            ))),
        }
    }

    /// Reserve every slot in `start..=end` for `pid`, or none of them.
    ///
    /// # Returns: `Result<Vec<SlotId>, SlotdError>`
    /// * `Ok(Vec<SlotId>)` - The reserved slots, in order
    /// * `Err(SlotdError::InvalidArgument)` - The range is not contiguous, inverted, or out of range
    /// * `Err(SlotdError::Busy)` - Some slot in the range is already reserved
    pub fn acquire_range(
        &self,
        pid: Pid,
        range_type: RangeType,
        start: u32,
        end: u32,
    ) -> Result<Vec<SlotId>, SlotdError> {
        if range_type != RangeType::Contiguous {
            return Err(SlotdError::InvalidArgument(format!(
                "{range_type:?} slot ranges are not supported"
            )));
        }
        let n = self.count.get();
        if start >= n || end >= n || start > end {
            return Err(SlotdError::InvalidArgument(format!(
                "slot range {start}..={end} is not valid for {n} slots"
            )));
        }

        let range = start as usize..=end as usize;
        let mut state = self.state()?;
        if let Some(busy) = range.clone().find(|&i| state.is_set(i)) {
            return Err(SlotdError::Busy(format!(
                "slot {busy} in {start}..={end} is already reserved"
            )));
        }
        for i in range.clone() {
            state.reserve(i, pid);
        }
        debug!("Slots {start}..={end} reserved by {pid}");
        Ok(range.map(|i| self.slot(i)).collect())
    }

    /// Release `slot` if `pid` owns it.
    pub fn release_one(&self, pid: Pid, slot: SlotId) -> Result<(), SlotdError> {
        let mut state = self.state()?;
        let i = slot.index();
        if state.is_set(i) && state.owners[i] == Some(pid) {
            state.free(i);
            debug!("Slot {slot} released by {pid}");
            Ok(())
        } else {
            Err(SlotdError::PermissionDenied(format!(
                "slot {slot} is not reserved by process {pid}"
            )))
        }
    }

    /// Release every slot `pid` owns and return them.
    pub fn release_owned_by(&self, pid: Pid) -> Result<Vec<SlotId>, SlotdError> {
        let mut state = self.state()?;
        let owned = state.owned_by(pid);
        for &i in &owned {
            state.free(i);
        }
        debug!("Released {} slots owned by {pid}", owned.len());
        Ok(owned.into_iter().map(|i| self.slot(i)).collect())
    }

    /// Clear the slots of a session that went away without releasing them.
    pub fn force_release_for_closed_session(&self, pid: Pid) -> Result<Vec<SlotId>, SlotdError> {
        let mut state = self.state()?;
        let owned = state.owned_by(pid);
        for &i in &owned {
            warn!("Slot {i} still reserved by {pid} at session close, forcing release");
            state.free(i);
        }
        Ok(owned.into_iter().map(|i| self.slot(i)).collect())
    }

    pub fn owner(&self, slot: SlotId) -> Result<Option<Pid>, SlotdError> {
        let state = self.state()?;
        let i = slot.index();
        Ok(if state.is_set(i) { state.owners[i] } else { None })
    }

    /// Fail with `PermissionDenied` unless `pid` holds `slot`.
    pub fn check_owner(&self, pid: Pid, slot: SlotId) -> Result<(), SlotdError> {
        match self.owner(slot)? {
            Some(owner) if owner == pid => Ok(()),
            _ => Err(SlotdError::PermissionDenied(format!(
                "slot {slot} is not reserved by process {pid}"
            ))),
        }
    }

    pub fn free_count(&self) -> Result<usize, SlotdError> {
        let state = self.state()?;
        Ok((0..self.count.get() as usize)
            .filter(|&i| !state.is_set(i))
            .count())
    }

    /// Whether every set bit has an owner and every clear bit has none.
    pub fn is_consistent(&self) -> bool {
        match self.state() {
            Ok(state) => (0..state.owners.len()).all(|i| state.is_set(i) == state.owners[i].is_some()),
            Err(_) => false,
        }
    }

    /// Leave the table's lock poisoned, as a panic while holding it would.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _state = self.state.lock();
            panic!("slot table poisoned for a test");
        }));
    }
}
