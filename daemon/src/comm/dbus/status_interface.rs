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

use crate::attributes::{read_all_attributes, read_attribute};
use crate::comm::dbus::{driver_version_tuple, DriverVersionTuple};
use crate::config::{DeviceSource, SlotdConfig};
use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::session::DriverVersion;
use crate::slots::SlotId;
use log::info;
use std::fmt::Write;
use std::sync::Arc;
use crate::error::SlotdDBusError;
use zbus::interface;

pub struct StatusInterface {
    pub registry: Arc<DeviceRegistry>,
    pub config: &'static SlotdConfig,
}

/// One line per setting, `key = value`.
pub(crate) fn render_config(config: &SlotdConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "slot_count = {}", config.geometry.slot_count);
    let _ = writeln!(out, "bytes_per_slot = {}", config.geometry.bytes_per_slot);
    for device in &config.devices {
        let source = match &device.source {
            DeviceSource::Resource(path) => path.display().to_string(),
            DeviceSource::Simulated => "simulated".to_string(),
        };
        let uio = device
            .uio
            .as_ref()
            .map_or_else(|| "none".to_string(), |p| p.display().to_string());
        let _ = writeln!(
            out,
            "device {} = {source} (uio: {uio}, avoid_dfh: {})",
            device.name, device.avoid_dfh
        );
    }
    out
}

#[interface(name = "com.canonical.slotd.status")]
impl StatusInterface {
    /// Every attached device as `(handle, configured name, endpoint name)`.
    async fn list_devices(&self) -> Result<Vec<(u64, String, String)>, SlotdDBusError> {
        info!("list_devices called");
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|(handle, device)| {
                (
                    handle.to_raw(),
                    device.config_name().to_string(),
                    device.name(),
                )
            })
            .collect())
    }

    async fn find_device(&self, name: &str) -> Result<u64, SlotdDBusError> {
        info!("find_device called with name: {name}");
        Ok(self.registry.find_by_name(name)?.to_raw())
    }

    async fn get_attribute(&self, device: u64, name: &str) -> Result<String, SlotdDBusError> {
        info!("get_attribute called with device: {device:#x} and name: {name}");
        let device = self.registry.get(DeviceHandle::from_raw(device))?;
        Ok(read_attribute(&device, name)?)
    }

    async fn get_attributes(&self, device: u64) -> Result<Vec<(String, String)>, SlotdDBusError> {
        info!("get_attributes called with device: {device:#x}");
        let device = self.registry.get(DeviceHandle::from_raw(device))?;
        Ok(read_all_attributes(&device))
    }

    /// Returns `(bytes_per_slot, slot_count, free_slots)`.
    async fn get_slot_geometry(&self, device: u64) -> Result<(u32, u32, u32), SlotdDBusError> {
        let device = self.registry.get(DeviceHandle::from_raw(device))?;
        let geometry = device.geometry();
        let free = device.slots().free_count()? as u32;
        Ok((geometry.bytes_per_slot, geometry.slot_count, free))
    }

    /// Reserved slots as `(slot, owner pid)`.
    async fn get_slot_owners(&self, device: u64) -> Result<Vec<(u32, u32)>, SlotdDBusError> {
        let device = self.registry.get(DeviceHandle::from_raw(device))?;
        let slots = device.slots();
        let mut owners = Vec::new();
        for index in 0..slots.count().get() {
            let slot = SlotId::new(index, slots.count())?;
            if let Some(pid) = slots.owner(slot)? {
                owners.push((index, pid.get()));
            }
        }
        Ok(owners)
    }

    async fn get_config(&self) -> String {
        info!("get_config called");
        render_config(self.config)
    }

    async fn get_driver_version(&self) -> DriverVersionTuple {
        driver_version_tuple(DriverVersion::current())
    }
}
