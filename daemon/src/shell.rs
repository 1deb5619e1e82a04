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

//! Constants describing the shell: the fixed part of the FPGA image that surrounds the user role.

use std::fmt;

/// Interpretation addresses, the high half of a logical `(interp, app)` register address.
pub mod interp {
    pub const FULL_STATUS: u32 = 0;
    pub const DONE_STATUS: u32 = 1;
    pub const PEND_STATUS: u32 = 2;
    pub const GENERAL_PURPOSE: u32 = 3;
    pub const SOFT_REG: u32 = 8;
    pub const ASMI_RSU: u32 = 10;
    pub const OVERRIDE_OUT_DATA_SIZE: u32 = 12;
    pub const INTERRUPT: u32 = 14;
    pub const DMA_DESCRIPTORS: u32 = 15;
}

/// Soft register index of the first slot DMA register.
pub const SOFT_REG_SLOT_DMA_BASE: u64 = 0x7E00;
/// Soft register that accepts packed `(legacy_offset << 32) | value` writes.
pub const SOFT_REG_MAPPING_SLOT: u64 = SOFT_REG_SLOT_DMA_BASE + 63;
pub const SOFT_REG_FULL_STATUS: u64 = SOFT_REG_SLOT_DMA_BASE + 62;
pub const SOFT_REG_DONE_STATUS: u64 = SOFT_REG_SLOT_DMA_BASE + 61;
pub const SOFT_REG_PEND_STATUS: u64 = SOFT_REG_SLOT_DMA_BASE + 60;
/// First of the five "override out data size" registers, for apps 2 to 6.
pub const SOFT_REG_OVERRIDE_OUT_DATA_SIZE: u64 = SOFT_REG_SLOT_DMA_BASE + 55;
pub const SOFT_REG_INTERRUPT_COALESCE: u64 = SOFT_REG_SLOT_DMA_BASE + 54;
/// Highest DMA descriptor app with its own soft register.
pub const SOFT_REG_LAST_DMA_DESCRIPTOR: u32 = 53;

/// App addresses within [`interp::INTERRUPT`].
pub const INTERRUPT_APP_STATUS: u32 = 256;
pub const INTERRUPT_APP_COALESCE: u32 = 257;
/// App address within [`interp::OVERRIDE_OUT_DATA_SIZE`] holding the TX engine payload size.
pub const OVERRIDE_APP_MAX_PAYLOAD: u32 = 2;

/// Per-slot DMA address registers, repeated every [`DMA_SLOT_STRIDE`] bytes.
pub const DMA_SLOT_INPUT_BASE_ADDRESS: usize = 0x90_1000;
pub const DMA_SLOT_OUTPUT_BASE_ADDRESS: usize = 0x90_1008;
pub const DMA_SLOT_CONTROL_RESULT_BASE_ADDRESS: usize = 0x90_1010;
pub const DMA_SLOT_STRIDE: usize = 0x20;

/// Bytes of the shared control region owned by each slot.
pub const FPGA_CONTROL_SIZE: usize = 64;
/// Bytes of the shared result region owned by each slot.
pub const FPGA_RESULT_SIZE: usize = 128;

/// General purpose (shell) register indices, read through [`interp::GENERAL_PURPOSE`].
pub mod gp {
    pub const BOARD_REVISION: u32 = 56;
    pub const BOARD_ID: u32 = 57;
    pub const SHELL_RELEASE_VERSION: u32 = 58;
    pub const CHIP_ID_LOW: u32 = 62;
    pub const CHIP_ID_HIGH: u32 = 63;
    pub const SHELL_ID: u32 = 64;
    pub const ROLE_VERSION: u32 = 65;
    pub const TEMPERATURE: u32 = 71;
    pub const SHELL_IDENTITY: u32 = 91;
    pub const ROLE_ID: u32 = 101;
}

pub const SHELL_IDENTITY_FUNCTION_MASK: u32 = 0xffff;
pub const SHELL_IDENTITY_ENDPOINT_SHIFT: u32 = 16;
pub const SHELL_IDENTITY_ENDPOINT_MASK: u32 = 0xf;

/// Feature header sub-offsets.
pub const DFH_GUID_OFFSET_LOWER: usize = 0x08;
pub const DFH_GUID_OFFSET_HIGHER: usize = 0x10;

/// Shell control feature registers.
pub const DFH_DMA_CONTROL_REG_OFFSET: usize = 0x18;
pub const DFH_ROLE_CONTROL_REG_OFFSET: usize = 0x20;
pub const DMA_FUNCTION_SELECT_BIT: u64 = 1 << 0;
pub const ROLE_INTERRUPT_MASK_BIT: u64 = 1 << 0;
pub const ISOLATE_ROLE_BIT: u64 = 1 << 1;

/// Interrupt feature registers.
pub const DFH_INTERRUPT_STATUS_REG_OFFSET: usize = 0x20;
pub const SLOT_DMA_INTERRUPT_BIT: u64 = 1 << 0;

/// A 128-bit feature identifier, stored in the byte order the card reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Guid {
        let a = d1.to_le_bytes();
        let b = d2.to_le_bytes();
        let c = d3.to_le_bytes();
        Guid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4],
            d4[5], d4[6], d4[7],
        ])
    }

    /// Build a GUID from the two 64-bit words at `+0x08` and `+0x10` of a feature header.
    pub fn from_registers(lower: u64, higher: u64) -> Guid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lower.to_le_bytes());
        bytes[8..].copy_from_slice(&higher.to_le_bytes());
        Guid(bytes)
    }

    /// The inverse of [`Guid::from_registers`].
    pub fn to_registers(self) -> (u64, u64) {
        let mut lower = [0u8; 8];
        let mut higher = [0u8; 8];
        lower.copy_from_slice(&self.0[..8]);
        higher.copy_from_slice(&self.0[8..]);
        (u64::from_le_bytes(lower), u64::from_le_bytes(higher))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

pub const GUID_LEGACY_FUNCTION: Guid = Guid::from_fields(0, 0, 0, [0; 8]);

pub const GUID_ROLE_FUNCTION: Guid = Guid::from_fields(
    0x4067_F10B,
    0xC65B,
    0x44A7,
    [0xAD, 0x6E, 0x60, 0xE4, 0x89, 0xBF, 0x32, 0xC5],
);

pub const GUID_MANAGEMENT_FUNCTION: Guid = Guid::from_fields(
    0xDC32_A288,
    0x935D,
    0x4BA7,
    [0x99, 0xCF, 0xB5, 0x1F, 0xBE, 0xD5, 0xCA, 0x7C],
);

pub const GUID_SHELL_CONTROL_FEATURE: Guid = Guid::from_fields(
    0x3ABD_40CA,
    0x48B5,
    0x450D,
    [0x94, 0x79, 0x1B, 0xD9, 0x70, 0x00, 0x7B, 0x8D],
);

pub const GUID_INTERRUPT_FEATURE: Guid = Guid::from_fields(
    0x73AC_D711,
    0x2CCF,
    0x4305,
    [0xA4, 0x1F, 0x3E, 0x0A, 0xD6, 0x76, 0xB2, 0x52],
);
