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

use crate::comm::dbus::{
    buffer_pointers_tuple, caller_pid, driver_version_tuple, register_info_tuple, sender_of,
    BufferPointersTuple, DriverVersionTuple, RegisterInfoTuple,
};
use crate::registry::DeviceHandle;
use crate::session::ControlService;
use log::{info, trace};
use std::sync::Arc;
use zbus::message::Header;
use zbus::zvariant::OwnedFd;
use crate::error::SlotdDBusError;
use zbus::{interface, Connection};

pub struct ControlInterface {
    pub service: Arc<ControlService>,
}

#[interface(name = "com.canonical.slotd.control")]
impl ControlInterface {
    async fn open_session(
        &self,
        device: u64,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> Result<u64, SlotdDBusError> {
        let sender = sender_of(&header)?;
        info!("open_session called by {sender} for device {device:#x}");
        let pid = caller_pid(connection, &header).await?;
        Ok(self
            .service
            .open_session(DeviceHandle::from_raw(device), pid, &sender)?)
    }

    /// Returns the slots that were still reserved and had to be released.
    async fn close_session(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<Vec<u32>, SlotdDBusError> {
        let sender = sender_of(&header)?;
        info!("close_session called by {sender} for session {session}");
        Ok(self
            .service
            .close_session(session, &sender)?
            .iter()
            .map(|slot| slot.get())
            .collect())
    }

    async fn get_register_info(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<RegisterInfoTuple, SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(register_info_tuple(
            self.service.register_info(session, &sender)?,
        ))
    }

    async fn interrupt_enable(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self
            .service
            .set_interrupts_enabled(session, &sender, true)?)
    }

    async fn interrupt_disable(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self
            .service
            .set_interrupts_enabled(session, &sender, false)?)
    }

    async fn get_buffer_pointers(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<BufferPointersTuple, SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(buffer_pointers_tuple(
            self.service.buffer_pointers(session, &sender)?,
        ))
    }

    async fn get_driver_version(&self) -> DriverVersionTuple {
        driver_version_tuple(self.service.driver_version())
    }

    /// Returns `(bytes_per_slot, slot_count)`.
    async fn get_slot_config(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(u32, u32), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.slot_config(session, &sender)?)
    }

    async fn acquire_slot(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<u32, SlotdDBusError> {
        let sender = sender_of(&header)?;
        let slot = self.service.acquire_slot(session, &sender)?;
        trace!("Session {session} acquired slot {slot}");
        Ok(slot)
    }

    async fn release_slot(
        &self,
        session: u64,
        slot: u32,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.release_slot(session, &sender, slot)?)
    }

    async fn acquire_slot_range(
        &self,
        session: u64,
        range_type: u32,
        start: u32,
        end: u32,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self
            .service
            .acquire_slot_range(session, &sender, range_type, start, end)?)
    }

    async fn release_slot_range(
        &self,
        session: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<Vec<u32>, SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.release_slot_range(session, &sender)?)
    }

    async fn get_slot_event(
        &self,
        session: u64,
        slot: u32,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.get_slot_event(session, &sender, slot)?)
    }

    /// A `timeout_ms` of 0 waits forever. With `wait` false the call only polls.
    async fn wait_slot_event(
        &self,
        session: u64,
        slot: u32,
        timeout_ms: u32,
        wait: bool,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self
            .service
            .wait_slot_event(session, &sender, slot, timeout_ms, wait)
            .await?)
    }

    async fn reset_slot_event(
        &self,
        session: u64,
        slot: u32,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.reset_slot_event(session, &sender, slot)?)
    }

    async fn complete_slot_event(
        &self,
        session: u64,
        slot: u32,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(), SlotdDBusError> {
        let sender = sender_of(&header)?;
        Ok(self.service.complete_slot_event(session, &sender, slot)?)
    }

    /// Returns the descriptor to `mmap`, the offset into it, the length and whether the mapping
    /// may be cached.
    async fn map_region(
        &self,
        session: u64,
        offset: u64,
        size: u64,
        #[zbus(header)] header: Header<'_>,
    ) -> Result<(OwnedFd, u64, u64, bool), SlotdDBusError> {
        let sender = sender_of(&header)?;
        let region = self.service.map(session, &sender, offset, size)?;
        Ok((OwnedFd::from(region.fd), region.offset, region.len, region.cached))
    }
}
