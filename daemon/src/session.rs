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

//! Client sessions and the requests they can make.
//!
//! A session binds one client, identified by its bus name and process id, to one device. Every
//! request names its session and is refused unless it comes from the bus name that opened it. The
//! process id is the credential for slot ownership.
//!
//! Closing a session cancels its pending waits and force-releases the slots its process still
//! holds.

use crate::completion::{CancelHandle, Cancellation, WaitMode};
use crate::device::{DeviceContext, RegisterInfo};
use crate::dma_pool::BufferPointers;
use crate::error::SlotdError;
use crate::mapping::{map_region, MappedRegion};
use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::slots::{Pid, RangeType, SlotId};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const PRODUCT_VERSION_MAJOR: u16 = 1;
pub const PRODUCT_VERSION_MINOR: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub product_major: u16,
    pub product_minor: u16,
    pub build_major: u16,
    pub build_minor: u16,
}

impl DriverVersion {
    pub fn current() -> DriverVersion {
        DriverVersion {
            product_major: PRODUCT_VERSION_MAJOR,
            product_minor: PRODUCT_VERSION_MINOR,
            build_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            build_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        }
    }
}

#[derive(Debug)]
struct Session {
    handle: DeviceHandle,
    device: Arc<DeviceContext>,
    pid: Pid,
    bus_name: String,
    interrupts_enabled: bool,
    cancel: CancelHandle,
}

/// What a request needs from its session, copied out so no lock is held while it runs.
#[derive(Debug, Clone)]
struct SessionView {
    device: Arc<DeviceContext>,
    pid: Pid,
    cancel: Cancellation,
}

#[derive(Debug)]
pub struct ControlService {
    registry: Arc<DeviceRegistry>,
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
}

impl ControlService {
    pub fn new(registry: Arc<DeviceRegistry>) -> ControlService {
        ControlService {
            registry,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<u64, Session>>, SlotdError> {
        self.sessions
            .lock()
            .map_err(|_| SlotdError::Internal("session table lock poisoned".to_string()))
    }

    fn view(&self, id: u64, bus_name: &str) -> Result<SessionView, SlotdError> {
        let sessions = self.sessions()?;
        let session = checked(&sessions, id, bus_name)?;
        Ok(SessionView {
            device: session.device.clone(),
            pid: session.pid,
            cancel: session.cancel.token(),
        })
    }

    fn slot(view: &SessionView, index: u32) -> Result<SlotId, SlotdError> {
        SlotId::new(index, view.device.slots().count())
    }

    /// Open a session on `handle` for the process `pid` reachable at `bus_name`.
    pub fn open_session(
        &self,
        handle: DeviceHandle,
        pid: Pid,
        bus_name: &str,
    ) -> Result<u64, SlotdError> {
        let device = self.registry.get(handle)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            "Session {id} opened on {} by process {pid} ({bus_name})",
            device.config_name()
        );
        self.sessions()?.insert(
            id,
            Session {
                handle,
                device,
                pid,
                bus_name: bus_name.to_string(),
                interrupts_enabled: false,
                cancel: CancelHandle::new(),
            },
        );
        Ok(id)
    }

    /// Close a session, returning the slots that had to be force-released.
    pub fn close_session(&self, id: u64, bus_name: &str) -> Result<Vec<SlotId>, SlotdError> {
        let session = {
            let mut sessions = self.sessions()?;
            checked(&sessions, id, bus_name)?;
            sessions.remove(&id).ok_or_else(|| unknown_session(id))?
        };
        finish(id, session)
    }

    /// Close every session opened from `bus_name`. Used when that client leaves the bus.
    pub fn close_sessions_of(&self, bus_name: &str) -> Result<usize, SlotdError> {
        let closing: Vec<(u64, Session)> = {
            let mut sessions = self.sessions()?;
            let ids: Vec<u64> = sessions
                .iter()
                .filter(|(_, s)| s.bus_name == bus_name)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };
        let count = closing.len();
        finish_all(closing)?;
        if count > 0 {
            info!("Closed {count} sessions of departed client {bus_name}");
        }
        Ok(count)
    }

    /// Close every open session. Used when the daemon shuts down.
    pub fn close_all_sessions(&self) -> Result<usize, SlotdError> {
        let closing: Vec<(u64, Session)> = self.sessions()?.drain().collect();
        let count = closing.len();
        finish_all(closing)?;
        info!("Closed {count} sessions on shutdown");
        Ok(count)
    }

    pub fn session_count(&self) -> Result<usize, SlotdError> {
        Ok(self.sessions()?.len())
    }

    pub fn session_device(&self, id: u64, bus_name: &str) -> Result<DeviceHandle, SlotdError> {
        let sessions = self.sessions()?;
        Ok(checked(&sessions, id, bus_name)?.handle)
    }

    pub fn register_info(&self, id: u64, bus_name: &str) -> Result<RegisterInfo, SlotdError> {
        Ok(self.view(id, bus_name)?.device.register_info())
    }

    /// Record whether the client wants completion interrupts. Completions are signalled either
    /// way.
    pub fn set_interrupts_enabled(
        &self,
        id: u64,
        bus_name: &str,
        enabled: bool,
    ) -> Result<(), SlotdError> {
        let mut sessions = self.sessions()?;
        checked(&sessions, id, bus_name)?;
        if let Some(session) = sessions.get_mut(&id) {
            session.interrupts_enabled = enabled;
            debug!("Session {id} interrupts enabled: {enabled}");
        }
        Ok(())
    }

    pub fn interrupts_enabled(&self, id: u64, bus_name: &str) -> Result<bool, SlotdError> {
        let sessions = self.sessions()?;
        Ok(checked(&sessions, id, bus_name)?.interrupts_enabled)
    }

    pub fn buffer_pointers(&self, id: u64, bus_name: &str) -> Result<BufferPointers, SlotdError> {
        Ok(self.view(id, bus_name)?.device.pool().buffer_pointers())
    }

    pub fn driver_version(&self) -> DriverVersion {
        DriverVersion::current()
    }

    /// `(bytes_per_slot, slot_count)` of the session's device.
    pub fn slot_config(&self, id: u64, bus_name: &str) -> Result<(u32, u32), SlotdError> {
        let geometry = self.view(id, bus_name)?.device.geometry();
        Ok((geometry.bytes_per_slot, geometry.slot_count))
    }

    pub fn acquire_slot(&self, id: u64, bus_name: &str) -> Result<u32, SlotdError> {
        let view = self.view(id, bus_name)?;
        Ok(view.device.slots().acquire_one(view.pid)?.get())
    }

    pub fn release_slot(&self, id: u64, bus_name: &str, slot: u32) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        let slot = Self::slot(&view, slot)?;
        view.device.slots().release_one(view.pid, slot)
    }

    pub fn acquire_slot_range(
        &self,
        id: u64,
        bus_name: &str,
        range_type: u32,
        start: u32,
        end: u32,
    ) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        view.device
            .slots()
            .acquire_range(view.pid, RangeType::from(range_type), start, end)
            .map(|_| ())
    }

    /// Release every slot the session's process holds and return their indices.
    pub fn release_slot_range(&self, id: u64, bus_name: &str) -> Result<Vec<u32>, SlotdError> {
        let view = self.view(id, bus_name)?;
        Ok(view
            .device
            .slots()
            .release_owned_by(view.pid)?
            .iter()
            .map(SlotId::get)
            .collect())
    }

    /// Check that `slot` names a slot of the session's device.
    pub fn get_slot_event(&self, id: u64, bus_name: &str, slot: u32) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        Self::slot(&view, slot).map(|_| ())
    }

    /// Wait for `slot` to complete. The wait never changes the slot's event.
    ///
    /// # Returns: `Result<(), SlotdError>`
    /// * `Err(SlotdError::WouldBlock)` - `wait` is false and the event is not signalled
    /// * `Err(SlotdError::Timeout)` - `timeout_ms` elapsed first
    /// * `Err(SlotdError::Interrupted)` - the session was closed during the wait
    pub async fn wait_slot_event(
        &self,
        id: u64,
        bus_name: &str,
        slot: u32,
        timeout_ms: u32,
        wait: bool,
    ) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        let slot = Self::slot(&view, slot)?;
        let mode = WaitMode::from_request(timeout_ms, wait);
        view.device
            .completions()
            .wait(slot, mode, &view.cancel)
            .await
    }

    pub fn reset_slot_event(&self, id: u64, bus_name: &str, slot: u32) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        let slot = Self::slot(&view, slot)?;
        view.device.completions().reset(slot);
        Ok(())
    }

    pub fn complete_slot_event(
        &self,
        id: u64,
        bus_name: &str,
        slot: u32,
    ) -> Result<(), SlotdError> {
        let view = self.view(id, bus_name)?;
        let slot = Self::slot(&view, slot)?;
        view.device.completions().signal(slot);
        Ok(())
    }

    pub fn map(
        &self,
        id: u64,
        bus_name: &str,
        offset: u64,
        size: u64,
    ) -> Result<MappedRegion, SlotdError> {
        let view = self.view(id, bus_name)?;
        map_region(&view.device, offset, size, view.pid)
    }
}

fn unknown_session(id: u64) -> SlotdError {
    SlotdError::InvalidArgument(format!("no session {id}"))
}

fn checked<'a>(
    sessions: &'a HashMap<u64, Session>,
    id: u64,
    bus_name: &str,
) -> Result<&'a Session, SlotdError> {
    let session = sessions.get(&id).ok_or_else(|| unknown_session(id))?;
    if session.bus_name != bus_name {
        return Err(SlotdError::PermissionDenied(format!(
            "session {id} does not belong to {bus_name}"
        )));
    }
    Ok(session)
}

fn finish(id: u64, session: Session) -> Result<Vec<SlotId>, SlotdError> {
    session.cancel.cancel();
    let released = session
        .device
        .slots()
        .force_release_for_closed_session(session.pid)?;
    if !released.is_empty() {
        warn!(
            "Session {id} of process {} closed holding {} slots",
            session.pid,
            released.len()
        );
    }
    info!("Session {id} closed");
    Ok(released)
}

/// Finish every session even when some fail, then report the first failure.
fn finish_all(closing: Vec<(u64, Session)>) -> Result<(), SlotdError> {
    let mut first_error = None;
    for (id, session) in closing {
        if let Err(e) = finish(id, session) {
            error!("Session {id} did not close cleanly: {e}");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotGeometry;
    use crate::hardware::dma::{HostDmaAllocator, PAGE_SIZE};
    use crate::hardware::register_space::SimulatedRegisters;
    use googletest::prelude::*;
    use rstest::*;
    use std::time::Duration;

    const CLIENT: &str = ":1.42";

    fn service(slots: u32) -> (ControlService, DeviceHandle) {
        let regs = Arc::new(SimulatedRegisters::new(32 * 1024 * 1024));
        let geometry = SlotGeometry::new(slots, PAGE_SIZE as u32).expect("geometry");
        let device = DeviceContext::attach("sim0", regs, &HostDmaAllocator::new(), geometry, false)
            .expect("attach");
        let registry = Arc::new(DeviceRegistry::new());
        let handle = registry.insert(Arc::new(device)).expect("insert");
        (ControlService::new(registry), handle)
    }

    fn pid(raw: u32) -> Pid {
        Pid::new(raw).expect("pid")
    }

    #[gtest]
    fn requests_from_another_bus_name_are_refused() {
        let (service, handle) = service(4);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        expect_that!(
            service.acquire_slot(id, ":1.99"),
            err(displays_as(contains_substring("SlotdError::PermissionDenied")))
        );
        expect_that!(
            service.acquire_slot(id + 1, CLIENT),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    fn slot_config_and_register_info() {
        let (service, handle) = service(8);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        expect_that!(service.slot_config(id, CLIENT), ok(eq(&(PAGE_SIZE as u32, 8))));
        expect_that!(
            service.register_info(id, CLIENT).map(|info| info.region_count),
            ok(eq(&1))
        );
    }

    #[gtest]
    fn interrupt_flag_is_per_session() {
        let (service, handle) = service(4);
        let a = service.open_session(handle, pid(100), CLIENT).expect("open");
        let b = service.open_session(handle, pid(101), ":1.43").expect("open");
        service.set_interrupts_enabled(a, CLIENT, true).expect("enable");
        expect_that!(service.interrupts_enabled(a, CLIENT), ok(eq(&true)));
        expect_that!(service.interrupts_enabled(b, ":1.43"), ok(eq(&false)));
    }

    #[gtest]
    fn driver_version_reports_product_one_zero() {
        let (service, _) = service(2);
        let version = service.driver_version();
        expect_that!(version.product_major, eq(1));
        expect_that!(version.product_minor, eq(0));
    }

    #[gtest]
    fn range_acquire_and_release() {
        let (service, handle) = service(8);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        expect_that!(
            service.acquire_slot_range(id, CLIENT, RangeType::Contiguous as u32, 2, 4),
            ok(eq(&()))
        );
        expect_that!(
            service.acquire_slot_range(id, CLIENT, RangeType::Discontiguous as u32, 5, 6),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
        expect_that!(
            service.release_slot_range(id, CLIENT),
            ok(elements_are![eq(&2), eq(&3), eq(&4)])
        );
    }

    #[gtest]
    #[rstest]
    #[case::get(0)]
    #[case::reset(1)]
    #[case::complete(2)]
    fn slot_events_validate_the_index(#[case] request: u32) {
        let (service, handle) = service(4);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        let call = |slot| match request {
            0 => service.get_slot_event(id, CLIENT, slot),
            1 => service.reset_slot_event(id, CLIENT, slot),
            _ => service.complete_slot_event(id, CLIENT, slot),
        };
        expect_that!(call(3), ok(eq(&())));
        expect_that!(
            call(4),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    #[tokio::test]
    async fn complete_then_wait_then_reset() {
        let (service, handle) = service(4);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        service.complete_slot_event(id, CLIENT, 1).expect("complete");
        expect_that!(
            service.wait_slot_event(id, CLIENT, 1, 0, false).await,
            ok(eq(&()))
        );
        service.reset_slot_event(id, CLIENT, 1).expect("reset");
        expect_that!(
            service.wait_slot_event(id, CLIENT, 1, 0, false).await,
            err(displays_as(contains_substring("SlotdError::WouldBlock")))
        );
    }

    #[gtest]
    #[tokio::test]
    async fn closing_a_session_interrupts_its_waits() {
        let (service, handle) = service(4);
        let service = Arc::new(service);
        let id = service.open_session(handle, pid(100), CLIENT).expect("open");
        let waiter = {
            let service = service.clone();
            tokio::spawn(async move { service.wait_slot_event(id, CLIENT, 0, 0, true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.close_session(id, CLIENT).expect("close");
        let result = waiter.await.expect("waiter panicked");
        expect_that!(
            result,
            err(displays_as(contains_substring("SlotdError::Interrupted")))
        );
    }

    #[gtest]
    fn closing_releases_only_the_sessions_slots() {
        let (service, handle) = service(4);
        let a = service.open_session(handle, pid(100), CLIENT).expect("open");
        let b = service.open_session(handle, pid(200), ":1.43").expect("open");
        service.acquire_slot(a, CLIENT).expect("acquire");
        service.acquire_slot(b, ":1.43").expect("acquire");

        let released = service.close_session(a, CLIENT).expect("close");
        expect_that!(released.iter().map(SlotId::get).collect::<Vec<_>>(), elements_are![eq(&0)]);
        expect_that!(service.acquire_slot(b, ":1.43"), ok(eq(&0)));
    }

    #[gtest]
    fn departed_client_loses_every_session() {
        let (service, handle) = service(4);
        service.open_session(handle, pid(100), CLIENT).expect("open");
        service.open_session(handle, pid(100), CLIENT).expect("open");
        service.open_session(handle, pid(200), ":1.43").expect("open");
        expect_that!(service.close_sessions_of(CLIENT), ok(eq(&2)));
        expect_that!(service.session_count(), ok(eq(&1)));
    }

    #[gtest]
    fn a_failed_close_does_not_stop_the_others() {
        let registry = Arc::new(DeviceRegistry::new());
        let mut handles = Vec::new();
        for name in ["sim0", "sim1"] {
            let regs = Arc::new(SimulatedRegisters::new(32 * 1024 * 1024));
            let geometry = SlotGeometry::new(4, PAGE_SIZE as u32).expect("geometry");
            let device =
                DeviceContext::attach(name, regs, &HostDmaAllocator::new(), geometry, false)
                    .expect("attach");
            handles.push(registry.insert(Arc::new(device)).expect("insert"));
        }
        let service = ControlService::new(registry.clone());
        service.open_session(handles[0], pid(100), CLIENT).expect("open");
        let healthy = service.open_session(handles[1], pid(100), CLIENT).expect("open");
        service.acquire_slot(healthy, CLIENT).expect("acquire");
        let survivor = service.open_session(handles[1], pid(200), ":1.43").expect("open");
        registry.get(handles[0]).expect("device").slots().poison();

        expect_that!(
            service.close_sessions_of(CLIENT),
            err(displays_as(contains_substring("SlotdError::Internal")))
        );
        expect_that!(service.session_count(), ok(eq(&1)));
        expect_that!(service.acquire_slot(survivor, ":1.43"), ok(eq(&0)));
    }

    #[gtest]
    fn shutdown_closes_every_session() {
        let (service, handle) = service(4);
        let a = service.open_session(handle, pid(100), CLIENT).expect("open");
        service.open_session(handle, pid(200), ":1.43").expect("open");
        service.acquire_slot(a, CLIENT).expect("acquire");
        expect_that!(service.close_all_sessions(), ok(eq(&2)));
        expect_that!(service.session_count(), ok(eq(&0)));
        expect_that!(
            service.registry().get(handle).and_then(|d| d.slots().free_count()),
            ok(eq(&4))
        );
    }
}
