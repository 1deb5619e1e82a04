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

//! Error Wrapping File System I/O Helpers
//!
//! Thin wrappers around the standard library file operations the daemon needs, with
//! automatic conversion to [`SlotdError`] and trace logging. The daemon touches very few
//! files: its configuration file, the sysfs `resourceN` file of a PCI BAR and its
//! `iommu_group` link, the VFIO nodes under `/dev/vfio`, and the UIO character device that
//! delivers interrupts.

use crate::error::SlotdError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read the contents of a file to a String.
///
/// # Returns: `Result<String, SlotdError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(SlotdError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, SlotdError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(SlotdError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Open an existing file for reading and writing without truncating it.
///
/// Used for device nodes and sysfs resource files, which must never be created or truncated.
///
/// # Returns: `Result<File, SlotdError>`
/// * `Ok(File)` - The open file
/// * `Err(SlotdError::IORead)` - If the file cannot be opened
pub fn fs_open_rw(file_path: &Path) -> Result<File, SlotdError> {
    trace!("Attempting to open {file_path:?} for read/write");
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)
        .map_err(|e| SlotdError::IORead {
            file: file_path.into(),
            e,
        })
}

/// Resolve one level of a symbolic link, as sysfs uses for `iommu_group`.
///
/// # Returns: `Result<PathBuf, SlotdError>`
/// * `Ok(PathBuf)` - The link target, as stored in the link
/// * `Err(SlotdError::IORead)` - If the path is missing or not a link
pub fn fs_read_link(link_path: &Path) -> Result<PathBuf, SlotdError> {
    trace!("Resolving link {link_path:?}");
    std::fs::read_link(link_path).map_err(|e| SlotdError::IORead {
        file: link_path.into(),
        e,
    })
}
