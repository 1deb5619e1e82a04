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

//! Daemon configuration.
//!
//! The configuration is read once from [`CONFIG_PATH`] and cached for the lifetime of the
//! process. When the file is missing or malformed the daemon falls back to hardcoded defaults
//! and logs a warning, so a broken file never prevents the service from starting.
//!
//! ```toml
//! [defaults]
//! slot_count = 64
//! bytes_per_slot = 1048576
//!
//! [[device]]
//! name = "fpga0"
//! resource = "/sys/bus/pci/devices/0000:3b:00.0/resource0"
//! uio = "/dev/uio0"
//!
//! [[device]]
//! name = "sim0"
//! simulated = true
//! ```

use crate::error::SlotdError;
use crate::slots::{MAX_SLOT_COUNT, MIN_SLOT_COUNT};
use crate::system_io::fs_read;
use log::{trace, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Location of the daemon configuration file.
pub static CONFIG_PATH: &str = "/etc/slotd/config.toml";

/// Hardcoded slot count used when the configuration does not provide one.
pub const DEFAULT_SLOT_COUNT: u32 = 0x40;

/// Hardcoded slot size used when the configuration does not provide one.
pub const DEFAULT_BYTES_PER_SLOT: u32 = 1024 * 1024;

/// Slot sizes must be whole pages so that every slot can be mapped on its own.
pub const SLOT_SIZE_GRANULE: u32 = 4096;

/// Size of the simulated register space used by `simulated = true` devices.
pub const SIMULATED_BAR_LEN: usize = 32 * 1024 * 1024;

/// The validated slot geometry shared by every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGeometry {
    pub slot_count: u32,
    pub bytes_per_slot: u32,
}

impl SlotGeometry {
    /// Validate a slot count and slot size pair.
    ///
    /// # Returns: `Result<SlotGeometry, SlotdError>`
    /// * `Ok(SlotGeometry)` - Both values are usable
    /// * `Err(SlotdError::InvalidArgument)` - The count is outside `2..=256` or the size is not a
    ///   non-zero multiple of [`SLOT_SIZE_GRANULE`]
    pub fn new(slot_count: u32, bytes_per_slot: u32) -> Result<SlotGeometry, SlotdError> {
        if !(MIN_SLOT_COUNT..=MAX_SLOT_COUNT).contains(&slot_count) {
            return Err(SlotdError::InvalidArgument(format!(
                "slot_count ({slot_count}) must be between {MIN_SLOT_COUNT} and {MAX_SLOT_COUNT}"
            )));
        }
        if bytes_per_slot == 0 || bytes_per_slot % SLOT_SIZE_GRANULE != 0 {
            return Err(SlotdError::InvalidArgument(format!(
                "bytes_per_slot ({bytes_per_slot}) must be a non-zero multiple of {SLOT_SIZE_GRANULE}"
            )));
        }
        Ok(SlotGeometry {
            slot_count,
            bytes_per_slot,
        })
    }
}

impl Default for SlotGeometry {
    fn default() -> Self {
        SlotGeometry {
            slot_count: DEFAULT_SLOT_COUNT,
            bytes_per_slot: DEFAULT_BYTES_PER_SLOT,
        }
    }
}

/// Where a configured device gets its registers from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    /// A sysfs PCI resource file, e.g. `/sys/bus/pci/devices/0000:3b:00.0/resource0`.
    Resource(PathBuf),
    /// An in-memory register file with no hardware behind it.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub source: DeviceSource,
    /// UIO node to read interrupts from. Without one a `resource` device uses its VFIO MSI.
    pub uio: Option<PathBuf>,
    pub avoid_dfh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotdConfig {
    pub geometry: SlotGeometry,
    pub devices: Vec<DeviceConfig>,
}

/// This is the top level struct which holds all sections
#[derive(Debug, Deserialize)]
struct TomlConfig {
    defaults: Option<DefaultsToml>,
    #[serde(default, rename = "device")]
    devices: Vec<DeviceToml>,
}

/// This is the "defaults" struct
#[derive(Debug, Deserialize)]
struct DefaultsToml {
    slot_count: Option<u32>,
    bytes_per_slot: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DeviceToml {
    name: String,
    resource: Option<PathBuf>,
    uio: Option<PathBuf>,
    #[serde(default)]
    simulated: bool,
    #[serde(default)]
    avoid_dfh: bool,
}

impl TryFrom<DeviceToml> for DeviceConfig {
    type Error = SlotdError;

    fn try_from(value: DeviceToml) -> Result<Self, Self::Error> {
        let source = match (value.simulated, value.resource) {
            (true, None) => DeviceSource::Simulated,
            (false, Some(resource)) => DeviceSource::Resource(resource),
            (true, Some(_)) => {
                return Err(SlotdError::InvalidArgument(format!(
                    "device '{}' cannot be both simulated and backed by a resource file",
                    value.name
                )));
            }
            (false, None) => {
                return Err(SlotdError::InvalidArgument(format!(
                    "device '{}' needs either `resource` or `simulated = true`",
                    value.name
                )));
            }
        };
        Ok(DeviceConfig {
            name: value.name,
            source,
            uio: value.uio,
            avoid_dfh: value.avoid_dfh,
        })
    }
}

/// Parse and validate configuration text.
pub fn parse_config(toml_string: &str, file: &Path) -> Result<SlotdConfig, SlotdError> {
    let config: TomlConfig = toml::from_str(toml_string).map_err(|e| SlotdError::TomlDe {
        file: file.to_path_buf(),
        e,
    })?;
    trace!("User provided config: {config:?}");

    let geometry = match config.defaults {
        Some(defaults) => SlotGeometry::new(
            defaults.slot_count.unwrap_or_else(|| {
                trace!("No slot_count provided. Using hardcoded value.");
                DEFAULT_SLOT_COUNT
            }),
            defaults.bytes_per_slot.unwrap_or_else(|| {
                trace!("No bytes_per_slot provided. Using hardcoded value.");
                DEFAULT_BYTES_PER_SLOT
            }),
        )?,
        None => SlotGeometry::default(),
    };

    let devices = config
        .devices
        .into_iter()
        .map(DeviceConfig::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SlotdConfig { geometry, devices })
}

/// Load configuration from a file.
pub fn config_from_file(config_path: &Path) -> Result<SlotdConfig, SlotdError> {
    if !config_path.is_file() {
        return Err(SlotdError::Internal(format!(
            "Config file not found in {config_path:?}. Using hardcoded defaults"
        )));
    }
    let toml_string = fs_read(config_path)?;
    parse_config(&toml_string, config_path)
}

static CONFIG: OnceLock<SlotdConfig> = OnceLock::new();

fn init_config() -> SlotdConfig {
    match config_from_file(Path::new(CONFIG_PATH)) {
        Ok(config) => {
            trace!("Successfully loaded config: {config:?}");
            config
        }
        Err(e) => {
            warn!("Using hardcoded defaults because failed to load config: {e}");
            SlotdConfig::default()
        }
    }
}

/// The process-wide configuration, loaded on first use.
pub fn slotd_config() -> &'static SlotdConfig {
    CONFIG.get_or_init(init_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    #[rstest]
    #[case::min(2, 4096)]
    #[case::max(256, 1024 * 1024)]
    #[case::default(DEFAULT_SLOT_COUNT, DEFAULT_BYTES_PER_SLOT)]
    fn geometry_accepts(#[case] count: u32, #[case] bytes: u32) {
        expect_that!(
            SlotGeometry::new(count, bytes),
            ok(eq(&SlotGeometry {
                slot_count: count,
                bytes_per_slot: bytes
            }))
        );
    }

    #[gtest]
    #[rstest]
    #[case::too_few(1, 4096)]
    #[case::too_many(257, 4096)]
    #[case::zero_bytes(4, 0)]
    #[case::not_page_multiple(4, 1000)]
    fn geometry_rejects(#[case] count: u32, #[case] bytes: u32) {
        expect_that!(
            SlotGeometry::new(count, bytes),
            err(displays_as(contains_substring("SlotdError::InvalidArgument")))
        );
    }

    #[gtest]
    fn parse_full_config() {
        let text = r#"
            [defaults]
            slot_count = 8
            bytes_per_slot = 65536

            [[device]]
            name = "fpga0"
            resource = "/sys/bus/pci/devices/0000:3b:00.0/resource0"
            uio = "/dev/uio0"

            [[device]]
            name = "sim0"
            simulated = true
            avoid_dfh = true
        "#;
        let config = parse_config(text, Path::new("test.toml")).expect("config should parse");
        expect_that!(config.geometry.slot_count, eq(8));
        expect_that!(config.geometry.bytes_per_slot, eq(65536));
        expect_that!(config.devices.len(), eq(2));
        expect_that!(
            config.devices[0].source,
            eq(&DeviceSource::Resource(PathBuf::from(
                "/sys/bus/pci/devices/0000:3b:00.0/resource0"
            )))
        );
        expect_that!(config.devices[0].uio, some(eq(&PathBuf::from("/dev/uio0"))));
        expect_that!(config.devices[1].source, eq(&DeviceSource::Simulated));
        expect_that!(config.devices[1].avoid_dfh, eq(true));
    }

    #[gtest]
    fn parse_without_defaults_uses_hardcoded_geometry() {
        let config = parse_config("", Path::new("empty.toml")).expect("empty config is valid");
        expect_that!(config.geometry, eq(SlotGeometry::default()));
        expect_that!(config.devices, is_empty());
    }

    #[gtest]
    #[rstest]
    #[case::bad_toml("[defaults", "SlotdError::TomlDe")]
    #[case::bad_count("[defaults]\nslot_count = 300\n", "SlotdError::InvalidArgument")]
    #[case::no_source("[[device]]\nname = \"x\"\n", "SlotdError::InvalidArgument")]
    #[case::two_sources(
        "[[device]]\nname = \"x\"\nsimulated = true\nresource = \"/r\"\n",
        "SlotdError::InvalidArgument"
    )]
    fn parse_rejects(#[case] text: &str, #[case] expected: &str) {
        expect_that!(
            parse_config(text, Path::new("bad.toml")),
            err(displays_as(contains_substring(expected)))
        );
    }
}
