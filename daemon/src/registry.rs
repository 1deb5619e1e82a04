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

//! The table of attached devices.
//!
//! Devices live in an arena indexed by [`DeviceHandle`]. A handle carries the generation of its
//! entry, so a handle kept after its device was removed never resolves to a device attached later
//! in the same entry.

use crate::device::DeviceContext;
use crate::error::SlotdError;
use log::info;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: u32,
    generation: u32,
}

impl DeviceHandle {
    /// `(generation << 32) | index`, the form handed to clients.
    pub fn to_raw(self) -> u64 {
        u64::from(self.generation) << 32 | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> DeviceHandle {
        DeviceHandle {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.to_raw())
    }
}

#[derive(Debug, Default)]
struct Entry {
    generation: u32,
    device: Option<Arc<DeviceContext>>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    /// Store `device`, reusing the first free entry.
    pub fn insert(&self, device: Arc<DeviceContext>) -> Result<DeviceHandle, SlotdError> {
        let mut entries = self.write()?;
        let index = match entries.iter().position(|e| e.device.is_none()) {
            Some(index) => index,
            None => {
                entries.push(Entry::default());
                entries.len() - 1
            }
        };
        let entry = &mut entries[index];
        entry.generation = entry.generation.wrapping_add(1);
        info!("Registered {} as device {index}", device.config_name());
        entry.device = Some(device);
        Ok(DeviceHandle {
            index: index as u32,
            generation: entry.generation,
        })
    }

    pub fn get(&self, handle: DeviceHandle) -> Result<Arc<DeviceContext>, SlotdError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SlotdError::Internal("device registry lock poisoned".to_string()))?;
        entries
            .get(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.device.clone())
            .ok_or_else(|| SlotdError::InvalidArgument(format!("no device with handle {handle}")))
    }

    /// Take the device out of the registry. The handle is stale afterwards.
    pub fn remove(&self, handle: DeviceHandle) -> Result<Arc<DeviceContext>, SlotdError> {
        let mut entries = self.write()?;
        entries
            .get_mut(handle.index as usize)
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.device.take())
            .ok_or_else(|| SlotdError::InvalidArgument(format!("no device with handle {handle}")))
    }

    /// Every attached device with its handle, in index order.
    pub fn list(&self) -> Result<Vec<(DeviceHandle, Arc<DeviceContext>)>, SlotdError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SlotdError::Internal("device registry lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .enumerate()
            .filter_map(|(index, e)| {
                e.device.clone().map(|device| {
                    (
                        DeviceHandle {
                            index: index as u32,
                            generation: e.generation,
                        },
                        device,
                    )
                })
            })
            .collect())
    }

    pub fn find_by_name(&self, name: &str) -> Result<DeviceHandle, SlotdError> {
        self.list()?
            .into_iter()
            .find(|(_, d)| d.config_name() == name || d.name() == name)
            .map(|(handle, _)| handle)
            .ok_or_else(|| SlotdError::InvalidArgument(format!("no device named '{name}'")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Entry>>, SlotdError> {
        self.entries
            .write()
            .map_err(|_| SlotdError::Internal("device registry lock poisoned".to_string()))
    }
}
