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

//! Read-only device attributes.
//!
//! Every attribute is a row in [`DEVICE_ATTRIBUTES`]: either a field of the device context or a
//! live register read with an optional mask and shift. [`render_attribute`] formats any row.

use crate::device::DeviceContext;
use crate::error::SlotdError;
use crate::shell::{gp, interp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `0x` prefixed hex, zero padded to 8 characters including the prefix.
    Hex,
    Decimal,
    Celsius,
}

#[derive(Debug, Clone, Copy)]
pub enum AttributeKind {
    Uint32Field(fn(&DeviceContext) -> u32),
    Uint64Field(fn(&DeviceContext) -> u64),
    StringField(fn(&DeviceContext) -> String),
    RegisterField {
        interp: u32,
        app: u32,
        /// Applied before the shift, `0` keeps every bit.
        mask: u32,
        shift: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Attribute {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub format: Format,
}

const fn gp_register(name: &'static str, app: u32) -> Attribute {
    Attribute {
        name,
        kind: AttributeKind::RegisterField {
            interp: interp::GENERAL_PURPOSE,
            app,
            mask: 0,
            shift: 0,
        },
        format: Format::Hex,
    }
}

pub const DEVICE_ATTRIBUTES: &[Attribute] = &[
    gp_register("shell_version", gp::SHELL_RELEASE_VERSION),
    gp_register("shell_id", gp::SHELL_ID),
    gp_register("role_version", gp::ROLE_VERSION),
    gp_register("role_id", gp::ROLE_ID),
    gp_register("board_id", gp::BOARD_ID),
    gp_register("board_revision", gp::BOARD_REVISION),
    Attribute {
        name: "chip_id",
        kind: AttributeKind::Uint64Field(|d| d.endpoint().chip_id),
        format: Format::Decimal,
    },
    Attribute {
        name: "endpoint_number",
        kind: AttributeKind::Uint32Field(|d| d.endpoint().endpoint_number),
        format: Format::Decimal,
    },
    Attribute {
        name: "function_number",
        kind: AttributeKind::Uint32Field(|d| d.endpoint().function_number),
        format: Format::Decimal,
    },
    Attribute {
        name: "function_type",
        kind: AttributeKind::StringField(|d| d.function().function_type.name().to_string()),
        format: Format::Decimal,
    },
    Attribute {
        name: "temperature",
        kind: AttributeKind::RegisterField {
            interp: interp::GENERAL_PURPOSE,
            app: gp::TEMPERATURE,
            mask: 0x0000_ff00,
            shift: 8,
        },
        format: Format::Celsius,
    },
];

fn format_number(value: u64, format: Format) -> String {
    match format {
        Format::Hex => format!("{value:#08x}"),
        Format::Decimal => value.to_string(),
        Format::Celsius => format!("{value} C"),
    }
}

pub fn render_attribute(device: &DeviceContext, attribute: &Attribute) -> String {
    match attribute.kind {
        AttributeKind::Uint32Field(get) => format_number(u64::from(get(device)), attribute.format),
        AttributeKind::Uint64Field(get) => format_number(get(device), attribute.format),
        AttributeKind::StringField(get) => get(device),
        AttributeKind::RegisterField {
            interp,
            app,
            mask,
            shift,
        } => {
            let mut value = device.translator().read(interp, app);
            if mask != 0 {
                value &= mask;
            }
            format_number(u64::from(value >> shift), attribute.format)
        }
    }
}

/// Render the attribute called `name`.
///
/// # Returns: `Result<String, SlotdError>`
/// * `Err(SlotdError::InvalidArgument)` - no attribute has that name
pub fn read_attribute(device: &DeviceContext, name: &str) -> Result<String, SlotdError> {
    DEVICE_ATTRIBUTES
        .iter()
        .find(|a| a.name == name)
        .map(|a| render_attribute(device, a))
        .ok_or_else(|| SlotdError::InvalidArgument(format!("no attribute named '{name}'")))
}

/// Every attribute as `(name, value)`, in table order.
pub fn read_all_attributes(device: &DeviceContext) -> Vec<(String, String)> {
    DEVICE_ATTRIBUTES
        .iter()
        .map(|a| (a.name.to_string(), render_attribute(device, a)))
        .collect()
}
