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

//! The DBus surface of the daemon.
//!
//! Both interfaces are thin: they identify the caller, convert arguments and hand the request to
//! the session layer or the registry.

pub mod control_interface;
pub mod status_interface;

use crate::device::RegisterInfo;
use crate::dma_pool::BufferPointers;
use crate::error::SlotdError;
use crate::session::DriverVersion;
use crate::slots::Pid;
use log::trace;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::{fdo, Connection};

pub const SERVICE_NAME: &str = "com.canonical.slotd";
pub const CONTROL_PATH: &str = "/com/canonical/slotd/control";
pub const STATUS_PATH: &str = "/com/canonical/slotd/status";

pub type RegisterInfoTuple = (u32, Vec<u64>);
pub type BufferPointersTuple = (u64, u64, u64, u64, u64, u64, u64, u64);
pub type DriverVersionTuple = (u16, u16, u16, u16);

/// The unique bus name of the caller.
pub(crate) fn sender_of(header: &Header<'_>) -> Result<String, SlotdError> {
    header
        .sender()
        .map(|sender| sender.to_string())
        .ok_or_else(|| SlotdError::PermissionDenied("message has no sender".to_string()))
}

/// Ask the bus which process sent the message.
pub(crate) async fn caller_pid(
    connection: &Connection,
    header: &Header<'_>,
) -> Result<Pid, SlotdError> {
    let sender = header
        .sender()
        .ok_or_else(|| SlotdError::PermissionDenied("message has no sender".to_string()))?;
    let dbus = fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| SlotdError::Internal(format!("cannot reach the bus daemon: {e}")))?;
    let pid = dbus
        .get_connection_unix_process_id(BusName::from(sender.to_owned()))
        .await
        .map_err(|e| SlotdError::PermissionDenied(format!("cannot identify {sender}: {e}")))?;
    trace!("{sender} is process {pid}");
    Pid::new(pid)
}

pub(crate) fn register_info_tuple(info: RegisterInfo) -> RegisterInfoTuple {
    (info.region_count, info.region_sizes.to_vec())
}

/// Sizes and bus addresses, in the order input, output, control, result.
pub(crate) fn buffer_pointers_tuple(p: BufferPointers) -> BufferPointersTuple {
    (
        p.input_size,
        p.input_bus,
        p.output_size,
        p.output_bus,
        p.control_size,
        p.control_bus,
        p.result_size,
        p.result_bus,
    )
}

pub(crate) fn driver_version_tuple(v: DriverVersion) -> DriverVersionTuple {
    (v.product_major, v.product_minor, v.build_major, v.build_minor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn register_info_lists_both_regions() {
        let info = RegisterInfo {
            region_count: 1,
            region_sizes: [0x200_0000, 0],
        };
        expect_that!(
            register_info_tuple(info),
            eq(&(1, vec![0x200_0000, 0]))
        );
    }

    #[gtest]
    fn buffer_pointers_keep_region_order() {
        let pointers = BufferPointers {
            input_size: 1,
            input_bus: 2,
            output_size: 3,
            output_bus: 4,
            control_size: 5,
            control_bus: 6,
            result_size: 7,
            result_bus: 8,
        };
        expect_that!(
            buffer_pointers_tuple(pointers),
            eq((1, 2, 3, 4, 5, 6, 7, 8))
        );
    }

    #[gtest]
    fn driver_version_is_product_then_build() {
        let version = DriverVersion {
            product_major: 1,
            product_minor: 0,
            build_major: 0,
            build_minor: 1,
        };
        expect_that!(driver_version_tuple(version), eq((1, 0, 0, 1)));
    }
}
