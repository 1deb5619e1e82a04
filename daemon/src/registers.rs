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

//! Logical register addressing.
//!
//! Shell registers are named by an `(interp, app)` pair. Two generations of shells exist:
//!
//! - **legacy** registers sit at `(app << 8) | (interp << 4) | 4` in the BAR and are accessed 32
//!   bits at a time. General purpose and ASMI/RSU registers always use this encoding.
//! - **packed soft registers** are 64-bit registers behind [`interp::SOFT_REG`]. Writes to any
//!   other interpretation address are packed as `(legacy_offset << 32) | value` into a single
//!   mapping register, and reads come from pre-decoded soft registers. The FULL, DONE and PEND
//!   status addresses are bitmaps with one bit per slot.
//!
//! Addresses with no mapping read as zero and ignore writes. An access the BAR rejects is logged
//! and treated the same way, so register traffic never fails a request.

use crate::hardware::register_space::Bar;
use crate::shell::*;
use log::{error, trace};

/// Byte offset of a legacy `(interp, app)` register.
pub fn register_offset(interp: u32, app: u32) -> usize {
    ((u64::from(app) << 8) | (u64::from(interp) << 4) | 4) as usize
}

fn soft_register_offset(index: u64) -> usize {
    register_offset(interp::SOFT_REG, index as u32)
}

#[derive(Debug, Clone)]
pub struct RegisterTranslator {
    bar: Bar,
}

impl RegisterTranslator {
    pub fn new(bar: Bar) -> RegisterTranslator {
        RegisterTranslator { bar }
    }

    pub fn bar(&self) -> &Bar {
        &self.bar
    }

    pub fn read(&self, interp_address: u32, app: u32) -> u32 {
        let value = match interp_address & 0xf {
            interp::FULL_STATUS => self.status_bit(SOFT_REG_FULL_STATUS, app),
            interp::DONE_STATUS => self.status_bit(SOFT_REG_DONE_STATUS, app),
            interp::PEND_STATUS => self.status_bit(SOFT_REG_PEND_STATUS, app),
            interp::GENERAL_PURPOSE | interp::ASMI_RSU => self.read_legacy(interp_address, app),
            interp::OVERRIDE_OUT_DATA_SIZE if (2..=6).contains(&app) => {
                self.read_soft(SOFT_REG_OVERRIDE_OUT_DATA_SIZE + u64::from(app - 2)) as u32
            }
            interp::INTERRUPT if app == INTERRUPT_APP_COALESCE => {
                self.read_soft(SOFT_REG_INTERRUPT_COALESCE) as u32
            }
            interp::DMA_DESCRIPTORS if app <= SOFT_REG_LAST_DMA_DESCRIPTOR => match app {
                4..=6 => self.read_legacy(interp_address, app),
                _ => self.read_soft(SOFT_REG_SLOT_DMA_BASE + u64::from(app)) as u32,
            },
            _ => 0,
        };
        trace!("register read ({interp_address}, {app}) = {value:#x}");
        value
    }

    pub fn write(&self, interp_address: u32, app: u32, value: u32) {
        trace!("register write ({interp_address}, {app}) <- {value:#x}");
        match interp_address & 0xf {
            interp::GENERAL_PURPOSE | interp::ASMI_RSU => {
                let offset = register_offset(interp_address, app);
                if let Err(e) = self.bar.write32(offset, value) {
                    error!("Legacy write to ({interp_address}, {app}) dropped: {e}");
                }
            }
            _ => {
                let packed = (register_offset(interp_address, app) as u64) << 32 | u64::from(value);
                if let Err(e) = self
                    .bar
                    .write64(soft_register_offset(SOFT_REG_MAPPING_SLOT), packed)
                {
                    error!("Soft register write to ({interp_address}, {app}) dropped: {e}");
                }
            }
        }
    }

    /// Read the legacy interrupt status word directly, bypassing the soft register mapping.
    pub fn read_interrupt_status(&self) -> u32 {
        self.read_legacy(interp::INTERRUPT, INTERRUPT_APP_STATUS)
    }

    fn read_legacy(&self, interp_address: u32, app: u32) -> u32 {
        let offset = register_offset(interp_address, app);
        self.bar.read32(offset).unwrap_or_else(|e| {
            error!("Legacy read of ({interp_address}, {app}) failed: {e}");
            0
        })
    }

    fn read_soft(&self, index: u64) -> u64 {
        self.bar
            .read64(soft_register_offset(index))
            .unwrap_or_else(|e| {
                error!("Soft register read of {index:#x} failed: {e}");
                0
            })
    }

    fn status_bit(&self, index: u64, app: u32) -> u32 {
        (self.read_soft(index).checked_shr(app).unwrap_or(0) & 1) as u32
    }
}
