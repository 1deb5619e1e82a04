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

use log::error;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SlotdError {
    #[error("SlotdError::InvalidArgument: {0}")]
    InvalidArgument(String),
    #[error("SlotdError::PermissionDenied: {0}")]
    PermissionDenied(String),
    #[error("SlotdError::ResourceExhausted: {0}")]
    ResourceExhausted(String),
    #[error("SlotdError::Busy: {0}")]
    Busy(String),
    #[error("SlotdError::Fault: {0}")]
    Fault(String),
    #[error("SlotdError::Timeout: {0}")]
    Timeout(String),
    #[error("SlotdError::WouldBlock: {0}")]
    WouldBlock(String),
    #[error("SlotdError::Interrupted: {0}")]
    Interrupted(String),
    #[error("SlotdError::Unsupported: {0}")]
    Unsupported(String),
    #[error("SlotdError::DmaAllocation: Failed to allocate {len} bytes of DMA memory: {reason}")]
    DmaAllocation { len: usize, reason: String },
    #[error("SlotdError::RoleIsolation: {0}")]
    RoleIsolation(String),
    #[error("SlotdError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("SlotdError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },
    #[error("SlotdError::TomlDe: Failed to parse {file:?}: {e}")]
    TomlDe { file: PathBuf, e: toml::de::Error },
    #[error("SlotdError::Vfio: {what} failed: {e}")]
    Vfio { what: String, e: std::io::Error },
    #[error("SlotdError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

/// The errors slotd answers DBus calls with, one error name per kind under
/// `com.canonical.slotd.Error`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "com.canonical.slotd.Error")]
pub enum SlotdDBusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidArgument(String),
    PermissionDenied(String),
    ResourceExhausted(String),
    Busy(String),
    Fault(String),
    Timeout(String),
    WouldBlock(String),
    Interrupted(String),
    Unsupported(String),
    NoMemory(String),
    RoleIsolation(String),
    IOError(String),
    Failed(String),
}

impl From<SlotdError> for SlotdDBusError {
    fn from(err: SlotdError) -> Self {
        error!("{err}");
        let message = err.to_string();
        match err {
            SlotdError::InvalidArgument(..) | SlotdError::TomlDe { .. } => {
                SlotdDBusError::InvalidArgument(message)
            }
            SlotdError::PermissionDenied(..) => SlotdDBusError::PermissionDenied(message),
            SlotdError::ResourceExhausted(..) => SlotdDBusError::ResourceExhausted(message),
            SlotdError::Busy(..) => SlotdDBusError::Busy(message),
            SlotdError::Fault(..) => SlotdDBusError::Fault(message),
            SlotdError::Timeout(..) => SlotdDBusError::Timeout(message),
            SlotdError::WouldBlock(..) => SlotdDBusError::WouldBlock(message),
            SlotdError::Interrupted(..) => SlotdDBusError::Interrupted(message),
            SlotdError::Unsupported(..) => SlotdDBusError::Unsupported(message),
            SlotdError::DmaAllocation { .. } => SlotdDBusError::NoMemory(message),
            SlotdError::RoleIsolation(..) => SlotdDBusError::RoleIsolation(message),
            SlotdError::IORead { .. } | SlotdError::IOWrite { .. } | SlotdError::Vfio { .. } => {
                SlotdDBusError::IOError(message)
            }
            SlotdError::Internal(..) => SlotdDBusError::Failed(message),
        }
    }
}
