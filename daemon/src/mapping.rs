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

//! The memory mapping surface.
//!
//! Clients name what they want mapped with a 64-bit offset whose top nibble selects the region.
//! For the per-slot regions the remaining bits divided by the slot size select the slot. A request
//! is validated, including slot ownership, before it is translated into a file descriptor the
//! client can `mmap`.

use crate::device::DeviceContext;
use crate::error::SlotdError;
use crate::slots::{Pid, SlotId};
use log::{debug, info};
use std::os::fd::OwnedFd;

pub const REGISTER_MAP_OFFSET: u64 = 0x0;
pub const INPUT_MAP_BASE: u64 = 0x1000_0000_0000_0000;
pub const OUTPUT_MAP_BASE: u64 = 0x2000_0000_0000_0000;
pub const RESULT_MAP_OFFSET: u64 = 0x3000_0000_0000_0000;
pub const CONTROL_MAP_OFFSET: u64 = 0x4000_0000_0000_0000;
pub const MAP_REGION_MASK: u64 = 0xF000_0000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRegion {
    Registers,
    Input(SlotId),
    Output(SlotId),
    Result,
    Control,
}

/// What a client maps: `len` bytes of `fd` starting at `offset`.
#[derive(Debug)]
pub struct MappedRegion {
    pub fd: OwnedFd,
    pub offset: u64,
    pub len: u64,
    /// False for device registers, which must be mapped uncached.
    pub cached: bool,
}

/// Work out which region `offset` names and check `pid` may map `size` bytes of it.
///
/// # Returns: `Result<MapRegion, SlotdError>`
/// * `Err(SlotdError::InvalidArgument)` - unknown offset, bad slot or bad size
/// * `Err(SlotdError::PermissionDenied)` - the slot is not owned by `pid`
pub fn classify_offset(
    device: &DeviceContext,
    offset: u64,
    size: u64,
    pid: Pid,
) -> Result<MapRegion, SlotdError> {
    let region = match offset {
        REGISTER_MAP_OFFSET => MapRegion::Registers,
        RESULT_MAP_OFFSET => MapRegion::Result,
        CONTROL_MAP_OFFSET => MapRegion::Control,
        _ => match offset & MAP_REGION_MASK {
            INPUT_MAP_BASE => MapRegion::Input(slot_for(device, offset, size, pid)?),
            OUTPUT_MAP_BASE => MapRegion::Output(slot_for(device, offset, size, pid)?),
            _ => {
                return Err(SlotdError::InvalidArgument(format!(
                    "invalid mapping offset {offset:#x}"
                )));
            }
        },
    };
    let available = region_len(device, region);
    if size == 0 || size > available {
        return Err(SlotdError::InvalidArgument(format!(
            "mapping size {size:#x} does not fit {region:?} of {available:#x} bytes"
        )));
    }
    Ok(region)
}

fn slot_for(device: &DeviceContext, offset: u64, size: u64, pid: Pid) -> Result<SlotId, SlotdError> {
    let bytes_per_slot = device.pool().bytes_per_slot() as u64;
    let within = offset & !MAP_REGION_MASK;
    if within % bytes_per_slot != 0 {
        return Err(SlotdError::InvalidArgument(format!(
            "mapping offset {offset:#x} is not on a slot boundary"
        )));
    }
    let index = u32::try_from(within / bytes_per_slot).map_err(|_| {
        SlotdError::InvalidArgument(format!("mapping offset {offset:#x} is past the last slot"))
    })?;
    let slot = SlotId::new(index, device.slots().count())?;
    if size != bytes_per_slot {
        return Err(SlotdError::InvalidArgument(format!(
            "slot mappings must be exactly {bytes_per_slot:#x} bytes, not {size:#x}"
        )));
    }
    device.slots().check_owner(pid, slot)?;
    Ok(slot)
}

fn region_len(device: &DeviceContext, region: MapRegion) -> u64 {
    let pool = device.pool();
    match region {
        MapRegion::Registers => device.translator().bar().len() as u64,
        MapRegion::Input(slot) => pool.input(slot).len() as u64,
        MapRegion::Output(slot) => pool.output(slot).len() as u64,
        MapRegion::Result => pool.result().len() as u64,
        MapRegion::Control => pool.control().len() as u64,
    }
}

/// Validate a mapping request and hand out the descriptor that backs it.
pub fn map_region(
    device: &DeviceContext,
    offset: u64,
    size: u64,
    pid: Pid,
) -> Result<MappedRegion, SlotdError> {
    debug!("{pid} asks to map {size:#x} bytes at {offset:#x}");
    let region = classify_offset(device, offset, size, pid)?;
    let pool = device.pool();
    let (fd, cached) = match region {
        MapRegion::Registers => {
            let fd = device.translator().bar().mapping_fd().ok_or_else(|| {
                SlotdError::Unsupported(format!(
                    "the registers of {} cannot be mapped",
                    device.config_name()
                ))
            })?;
            (fd, false)
        }
        MapRegion::Input(slot) => (pool.input(slot).as_fd(), true),
        MapRegion::Output(slot) => (pool.output(slot).as_fd(), true),
        MapRegion::Result => (pool.result().as_fd(), true),
        MapRegion::Control => (pool.control().as_fd(), true),
    };
    let fd = fd.try_clone_to_owned().map_err(|e| {
        SlotdError::Internal(format!("cannot duplicate the descriptor for {region:?}: {e}"))
    })?;
    info!("Mapping {region:?} of {} for {pid}", device.config_name());
    Ok(MappedRegion {
        fd,
        offset: 0,
        len: size,
        cached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotGeometry;
    use crate::hardware::dma::{HostDmaAllocator, PAGE_SIZE};
    use crate::hardware::register_space::SimulatedRegisters;
    use googletest::prelude::*;
    use rstest::*;
    use std::sync::Arc;

    const SLOT: u64 = PAGE_SIZE as u64;

    fn device() -> DeviceContext {
        let regs = Arc::new(SimulatedRegisters::new(32 * 1024 * 1024));
        let geometry = SlotGeometry::new(4, PAGE_SIZE as u32).expect("geometry");
        DeviceContext::attach("sim0", regs, &HostDmaAllocator::new(), geometry, false)
            .expect("attach")
    }

    fn pid(raw: u32) -> Pid {
        Pid::new(raw).expect("pid")
    }

    fn slot(device: &DeviceContext, index: u32) -> SlotId {
        SlotId::new(index, device.slots().count()).expect("slot")
    }

    #[gtest]
    fn owned_slots_map_by_offset() {
        let device = device();
        for _ in 0..3 {
            device.slots().acquire_one(pid(10)).expect("acquire");
        }
        expect_that!(
            classify_offset(&device, INPUT_MAP_BASE + 2 * SLOT, SLOT, pid(10)),
            ok(eq(&MapRegion::Input(slot(&device, 2))))
        );
        expect_that!(
            classify_offset(&device, OUTPUT_MAP_BASE, SLOT, pid(10)),
            ok(eq(&MapRegion::Output(slot(&device, 0))))
        );
    }

    #[gtest]
    #[rstest]
    #[case::unknown_region(0x5000_0000_0000_0000, SLOT)]
    #[case::past_last_slot(INPUT_MAP_BASE + 4 * SLOT, SLOT)]
    #[case::wrong_size(INPUT_MAP_BASE, 2 * SLOT)]
    #[case::unaligned(INPUT_MAP_BASE + 8, SLOT)]
    #[case::result_too_large(RESULT_MAP_OFFSET, 1 << 30)]
    #[case::empty_control(CONTROL_MAP_OFFSET, 0)]
    fn malformed_requests_are_invalid(#[case] offset: u64, #[case] size: u64) {
        let device = device();
        device.slots().acquire_one(pid(10)).expect("acquire");
        expect_that!(
            classify_offset(&device, offset, size, pid(10)),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    #[rstest]
    #[case::unreserved_slot(11)]
    #[case::foreign_slot(12)]
    fn slot_mapping_requires_ownership(#[case] caller: u32) {
        let device = device();
        device.slots().acquire_one(pid(11)).expect("acquire");
        let offset = if caller == 11 {
            INPUT_MAP_BASE + SLOT
        } else {
            INPUT_MAP_BASE
        };
        expect_that!(
            classify_offset(&device, offset, SLOT, pid(caller)),
            err(displays_as(contains_substring("SlotdError::PermissionDenied")))
        );
    }

    #[gtest]
    fn shared_regions_map_without_ownership() {
        let device = device();
        let region = map_region(&device, RESULT_MAP_OFFSET, 4 * 128, pid(5)).expect("map");
        expect_that!(region.cached, eq(true));
        expect_that!(region.len, eq(512));
        expect_that!(
            classify_offset(&device, CONTROL_MAP_OFFSET, 4 * 64, pid(5)),
            ok(eq(&MapRegion::Control))
        );
    }

    #[gtest]
    fn simulated_registers_cannot_be_mapped() {
        let device = device();
        expect_that!(
            map_region(&device, REGISTER_MAP_OFFSET, 4096, pid(5)).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::Unsupported")))
        );
    }
}
