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

#![allow(dead_code)]

use slotd::config::SlotGeometry;
use slotd::device::DeviceContext;
use slotd::hardware::dma::{HostDmaAllocator, PAGE_SIZE};
use slotd::hardware::register_space::SimulatedRegisters;
use slotd::registers::register_offset;
use slotd::registry::{DeviceHandle, DeviceRegistry};
use slotd::session::ControlService;
use slotd::shell::{interp, INTERRUPT_APP_STATUS};
use slotd::slots::Pid;
use std::sync::Arc;

pub const BAR_LEN: usize = 32 * 1024 * 1024;

/// One simulated device behind a control service.
pub struct Rig {
    pub regs: Arc<SimulatedRegisters>,
    pub device: Arc<DeviceContext>,
    pub handle: DeviceHandle,
    pub service: Arc<ControlService>,
}

impl Rig {
    pub fn new(slot_count: u32) -> Rig {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        let geometry = SlotGeometry::new(slot_count, PAGE_SIZE as u32).expect("valid geometry");
        let device = Arc::new(
            DeviceContext::attach("sim0", regs.clone(), &HostDmaAllocator::new(), geometry, false)
                .expect("simulated device attaches"),
        );
        let registry = Arc::new(DeviceRegistry::new());
        let handle = registry.insert(device.clone()).expect("registered");
        Rig {
            regs,
            device,
            handle,
            service: Arc::new(ControlService::new(registry)),
        }
    }

    pub fn open(&self, pid: u32, bus_name: &str) -> u64 {
        self.service
            .open_session(self.handle, Pid::new(pid).expect("pid"), bus_name)
            .expect("session opens")
    }

    /// Make the card report `status` on its next interrupt.
    pub fn set_interrupt_status(&self, status: u32) {
        self.regs.poke32(
            register_offset(interp::INTERRUPT, INTERRUPT_APP_STATUS),
            status,
        );
    }
}
