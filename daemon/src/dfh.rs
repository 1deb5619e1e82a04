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

//! Device Feature Header discovery.
//!
//! Newer shells describe themselves with a linked list of 64-bit feature headers starting at
//! offset 0 of the BAR. Each header carries a type tag, the relative offset of the next header and
//! an end-of-list flag, followed by a 128-bit GUID at `+0x08`/`+0x10`. The GUID of the base header
//! names the kind of PCI function (legacy, role or management); later headers name optional
//! features such as the interrupt feature and the shell control feature.
//!
//! Old shells have no DFH at offset 0. On some of them even reading that register is unsafe, so
//! a device can be configured with `avoid_dfh` to skip discovery altogether.

use crate::error::SlotdError;
use crate::hardware::register_space::Bar;
use crate::shell::*;
use log::{debug, error, info, warn};
use std::fmt;

/// Upper bound on the number of headers followed before giving up on a feature.
pub const MAX_DFH_ITERATIONS: usize = 256;

pub const DFH_TYPE_NOT_SUPPORTED: u8 = 0;
pub const DFH_TYPE_MAX: u8 = 5;

/// A raw feature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DfhHeader(pub u64);

impl DfhHeader {
    pub fn feature_id(&self) -> u16 {
        (self.0 & 0xfff) as u16
    }

    pub fn major(&self) -> u8 {
        ((self.0 >> 12) & 0xf) as u8
    }

    /// Offset of the next header relative to this one.
    pub fn next_offset(&self) -> usize {
        ((self.0 >> 16) & 0xff_ffff) as usize
    }

    pub fn end_of_list(&self) -> bool {
        (self.0 >> 40) & 1 == 1
    }

    pub fn minor(&self) -> u8 {
        ((self.0 >> 48) & 0xf) as u8
    }

    pub fn dfh_type(&self) -> u8 {
        (self.0 >> 60) as u8
    }

    pub fn is_supported(&self) -> bool {
        self.dfh_type() > DFH_TYPE_NOT_SUPPORTED && self.dfh_type() < DFH_TYPE_MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Legacy,
    Role,
    Management,
    Unknown,
}

impl FunctionType {
    pub fn name(&self) -> &'static str {
        match self {
            FunctionType::Legacy => "legacy",
            FunctionType::Role => "role",
            FunctionType::Management => "management",
            FunctionType::Unknown => "unknown",
        }
    }

    fn from_guid(guid: &Guid) -> FunctionType {
        match *guid {
            GUID_LEGACY_FUNCTION => FunctionType::Legacy,
            GUID_ROLE_FUNCTION => FunctionType::Role,
            GUID_MANAGEMENT_FUNCTION => FunctionType::Management,
            _ => FunctionType::Unknown,
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The result of classifying a function by its base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    pub function_type: FunctionType,
    pub dfh_supported: bool,
}

/// Feature discovery over one BAR.
#[derive(Debug, Clone)]
pub struct FeatureDirectory {
    bar: Bar,
    avoid_dfh: bool,
}

impl FeatureDirectory {
    pub fn new(bar: Bar, avoid_dfh: bool) -> FeatureDirectory {
        FeatureDirectory { bar, avoid_dfh }
    }

    /// The header at offset 0, or an unsupported header when discovery is disabled or the read
    /// fails.
    fn base_header(&self) -> DfhHeader {
        if self.avoid_dfh {
            return DfhHeader::default();
        }
        match self.bar.read_feature64(0) {
            Ok(raw) => DfhHeader(raw),
            Err(e) => {
                debug!("Cannot read the base feature header: {e}");
                DfhHeader::default()
            }
        }
    }

    fn read_guid(&self, offset: usize) -> Result<Guid, SlotdError> {
        let lower = self
            .bar
            .read_feature64(offset + DFH_GUID_OFFSET_LOWER)?;
        let higher = self
            .bar
            .read_feature64(offset + DFH_GUID_OFFSET_HIGHER)?;
        Ok(Guid::from_registers(lower, higher))
    }

    /// Walk the feature list looking for `guid`.
    ///
    /// # Returns: `usize`
    /// * the BAR offset of the matching header
    /// * `0` when the feature is absent, the function has no DFH, a header cannot be read, or the
    ///   walk exceeds [`MAX_DFH_ITERATIONS`]
    pub fn find_feature_offset(&self, guid: &Guid) -> usize {
        let mut header = self.base_header();
        let mut offset = 0usize;

        for _ in 0..MAX_DFH_ITERATIONS {
            if !header.is_supported() || header.end_of_list() {
                return 0;
            }
            offset += header.next_offset();
            let next = self
                .bar
                .read_feature64(offset)
                .and_then(|raw| Ok((DfhHeader(raw), self.read_guid(offset)?)));
            match next {
                Ok((next_header, found)) => {
                    if found == *guid {
                        debug!("Feature {guid} found at {offset:#x}");
                        return offset;
                    }
                    header = next_header;
                }
                Err(e) => {
                    debug!("Feature walk for {guid} stopped at {offset:#x}: {e}");
                    return 0;
                }
            }
        }

        warn!("Feature walk for {guid} exceeded {MAX_DFH_ITERATIONS} headers, treating as absent");
        0
    }

    /// Classify the function from the GUID of its base header.
    pub fn read_function_type(&self) -> FunctionInfo {
        let header = self.base_header();
        info!("Base feature header is {:#x}", header.0);
        if !header.is_supported() {
            info!("Not a DFH function, function type is legacy");
            return FunctionInfo {
                function_type: FunctionType::Legacy,
                dfh_supported: false,
            };
        }

        let function_type = match self.read_guid(0) {
            Ok(guid) => {
                info!("Function type GUID is {guid}");
                FunctionType::from_guid(&guid)
            }
            Err(e) => {
                error!("Cannot read the function type GUID: {e}");
                FunctionType::Legacy
            }
        };
        match function_type {
            FunctionType::Unknown => error!("Function type is unknown"),
            known => info!("Function type is {known}"),
        }
        FunctionInfo {
            function_type,
            dfh_supported: true,
        }
    }

    /// Hand the DMA engine and interrupts to the role function.
    ///
    /// On a management function with a shell control feature, the DMA function select is
    /// switched to the role and the role is isolated. The registers are read back and the
    /// function is rejected unless the role is isolated, its interrupts are unmasked and it owns
    /// the DMA engine.
    ///
    /// # Returns: `Result<usize, SlotdError>`
    /// * `Ok(usize)` - Offset of the interrupt feature, `0` if there is none
    /// * `Err(SlotdError::RoleIsolation)` - The read back did not show the expected state
    pub fn enable_role_function(&self, info: &FunctionInfo) -> Result<usize, SlotdError> {
        if !info.dfh_supported {
            info!("Device does not support DFH, role enable skipped");
            return Ok(0);
        }

        let interrupt_offset = self.find_feature_offset(&GUID_INTERRUPT_FEATURE);
        info!("Interrupt feature offset is {interrupt_offset:#x}");

        let shell_control = self.find_feature_offset(&GUID_SHELL_CONTROL_FEATURE);
        if shell_control == 0 {
            info!("Shell control feature not supported");
            return Ok(interrupt_offset);
        }
        if info.function_type != FunctionType::Management {
            info!("Function is {}, cannot switch control", info.function_type);
            return Ok(interrupt_offset);
        }

        info!("Management function found, switching control to the role");
        let dma_control = shell_control + DFH_DMA_CONTROL_REG_OFFSET;
        let role_control = shell_control + DFH_ROLE_CONTROL_REG_OFFSET;

        // The select bit toggles on write.
        let dma = self.bar.read_feature64(dma_control)?;
        if dma & DMA_FUNCTION_SELECT_BIT == 0 {
            self.bar
                .write_feature64(dma_control, dma | DMA_FUNCTION_SELECT_BIT)?;
        } else {
            info!("Role was already selected");
        }

        // Isolation can be set but never cleared. The interrupt mask is written back unchanged.
        let role = self.bar.read_feature64(role_control)?;
        self.bar
            .write_feature64(role_control, role | ISOLATE_ROLE_BIT)?;

        let role = self.bar.read_feature64(role_control)?;
        let dma = self.bar.read_feature64(dma_control)?;
        let isolated = role & ISOLATE_ROLE_BIT != 0;
        let interrupts_enabled = role & ROLE_INTERRUPT_MASK_BIT == 0;
        let role_selected = dma & DMA_FUNCTION_SELECT_BIT != 0;
        if !(isolated && interrupts_enabled && role_selected) {
            return Err(SlotdError::RoleIsolation(format!(
                "failed to isolate role or enable interrupt (isolated: {isolated}, interrupts enabled: {interrupts_enabled}, role selected: {role_selected})"
            )));
        }

        info!("Control switched to role function");
        Ok(interrupt_offset)
    }
}
