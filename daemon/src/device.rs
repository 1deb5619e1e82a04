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

//! One attached accelerator function.
//!
//! [`DeviceContext::attach`] brings the function up in a fixed order: the DMA pool is allocated
//! and published, the endpoint identity is read, the function is classified from its feature
//! headers and, on a management function, control is handed to the role. Any failure unwinds the
//! steps already taken. [`DeviceContext::detach`] releases everything symmetrically.

use crate::completion::{decode_interrupt_status, CompletionSet, InterruptStatus};
use crate::config::{DeviceConfig, DeviceSource, SlotGeometry, SIMULATED_BAR_LEN};
use crate::dfh::{FeatureDirectory, FunctionInfo};
use crate::dma_pool::DmaPool;
use crate::error::SlotdError;
use crate::hardware::dma::DmaAllocator;
use crate::hardware::register_space::{Bar, MmioRegion, RegisterSpace, SimulatedRegisters};
use crate::interrupts::InterruptHandler;
use crate::registers::RegisterTranslator;
use crate::shell::*;
use crate::slots::{SlotCount, SlotTable};
use log::{error, info, trace};
use std::sync::Arc;

/// Identity of the card and its shell, read once at attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    pub chip_id: u64,
    pub board_id: u32,
    pub board_revision: u32,
    pub shell_version: u32,
    pub shell_id: u32,
    pub role_version: u32,
    pub role_id: u32,
    pub endpoint_number: u32,
    /// Bits 15:0 of the shell identity register. This is the function number the shell reports
    /// for itself, not the PCI device/function number the card was enumerated at.
    pub function_number: u32,
}

impl EndpointInfo {
    pub fn read(translator: &RegisterTranslator) -> EndpointInfo {
        let read_gp = |index| translator.read(interp::GENERAL_PURPOSE, index);
        let identity = read_gp(gp::SHELL_IDENTITY);
        EndpointInfo {
            chip_id: u64::from(read_gp(gp::CHIP_ID_HIGH)) << 32 | u64::from(read_gp(gp::CHIP_ID_LOW)),
            board_id: read_gp(gp::BOARD_ID),
            board_revision: read_gp(gp::BOARD_REVISION),
            shell_version: read_gp(gp::SHELL_RELEASE_VERSION),
            shell_id: read_gp(gp::SHELL_ID),
            role_version: read_gp(gp::ROLE_VERSION),
            role_id: read_gp(gp::ROLE_ID),
            endpoint_number: (identity >> SHELL_IDENTITY_ENDPOINT_SHIFT)
                & SHELL_IDENTITY_ENDPOINT_MASK,
            function_number: identity & SHELL_IDENTITY_FUNCTION_MASK,
        }
    }

    /// `chip_id:endpoint:function`, unique across cards.
    pub fn name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.chip_id, self.endpoint_number, self.function_number
        )
    }
}

/// Region count and sizes of the register space, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterInfo {
    pub region_count: u32,
    pub region_sizes: [u64; 2],
}

#[derive(Debug)]
pub struct DeviceContext {
    config_name: String,
    translator: RegisterTranslator,
    endpoint: EndpointInfo,
    function: FunctionInfo,
    interrupt_feature_offset: usize,
    pool: DmaPool,
    slots: SlotTable,
    completions: CompletionSet,
}

impl DeviceContext {
    /// Bring up the function behind `space`.
    ///
    /// # Arguments
    ///
    /// * `config_name`: the name the device is configured under
    /// * `space`: the function's register BAR
    /// * `allocator`: where the DMA buffers come from
    /// * `geometry`: slot count and size
    /// * `avoid_dfh`: skip every feature header read, for shells that predate them
    ///
    /// # Returns: `Result<DeviceContext, SlotdError>`
    /// * `Err(SlotdError::DmaAllocation)` - a buffer could not be allocated
    /// * `Err(SlotdError::RoleIsolation)` - control could not be handed to the role
    pub fn attach(
        config_name: &str,
        space: Arc<dyn RegisterSpace>,
        allocator: &dyn DmaAllocator,
        geometry: SlotGeometry,
        avoid_dfh: bool,
    ) -> Result<DeviceContext, SlotdError> {
        let count = SlotCount::new(geometry.slot_count)?;
        let bar = Bar::new(space);
        let translator = RegisterTranslator::new(bar.clone());

        let pool = DmaPool::init(&translator, allocator, geometry)?;

        let endpoint = EndpointInfo::read(&translator);
        info!(
            "{config_name}: chip {:#x}, endpoint {}, function {}, shell {:#x} version {:#x}",
            endpoint.chip_id,
            endpoint.endpoint_number,
            endpoint.function_number,
            endpoint.shell_id,
            endpoint.shell_version
        );

        let features = FeatureDirectory::new(bar, avoid_dfh);
        let function = features.read_function_type();
        let interrupt_feature_offset = match features.enable_role_function(&function) {
            Ok(offset) => offset,
            Err(e) => {
                pool.teardown();
                return Err(e);
            }
        };

        info!(
            "{config_name}: attached as {} ({} function, {} slots of {:#x} bytes)",
            endpoint.name(),
            function.function_type,
            count.get(),
            geometry.bytes_per_slot
        );
        Ok(DeviceContext {
            config_name: config_name.to_string(),
            translator,
            endpoint,
            function,
            interrupt_feature_offset,
            pool,
            slots: SlotTable::new(count),
            completions: CompletionSet::new(count),
        })
    }

    /// Open the registers named by `config` and attach the device behind them.
    ///
    /// A real device is refused with `SlotdError::Unsupported` unless `allocator` hands out bus
    /// addresses the device can reach.
    pub fn attach_configured(
        config: &DeviceConfig,
        geometry: SlotGeometry,
        allocator: &dyn DmaAllocator,
    ) -> Result<DeviceContext, SlotdError> {
        let space: Arc<dyn RegisterSpace> = match &config.source {
            DeviceSource::Resource(path) => {
                if !allocator.device_visible() {
                    return Err(SlotdError::Unsupported(format!(
                        "{}: DMA buffers would not be reachable from {}",
                        config.name,
                        path.display()
                    )));
                }
                Arc::new(MmioRegion::open(path)?)
            }
            DeviceSource::Simulated => Arc::new(SimulatedRegisters::new(SIMULATED_BAR_LEN)),
        };
        DeviceContext::attach(&config.name, space, allocator, geometry, config.avoid_dfh)
    }

    /// Release the DMA pool. Callers must have closed every session first.
    pub fn detach(self) {
        info!("{}: detaching {}", self.config_name, self.endpoint.name());
        self.pool.teardown();
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn name(&self) -> String {
        self.endpoint.name()
    }

    pub fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    pub fn function(&self) -> &FunctionInfo {
        &self.function
    }

    pub fn interrupt_feature_offset(&self) -> usize {
        self.interrupt_feature_offset
    }

    pub fn translator(&self) -> &RegisterTranslator {
        &self.translator
    }

    pub fn pool(&self) -> &DmaPool {
        &self.pool
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn completions(&self) -> &CompletionSet {
        &self.completions
    }

    pub fn geometry(&self) -> SlotGeometry {
        SlotGeometry {
            slot_count: self.slots.count().get(),
            bytes_per_slot: self.pool.bytes_per_slot() as u32,
        }
    }

    pub fn register_info(&self) -> RegisterInfo {
        RegisterInfo {
            region_count: 1,
            region_sizes: [self.translator.bar().len() as u64, 0],
        }
    }

    /// Whether the interrupt feature, when present, says this is a slot DMA interrupt.
    fn is_slot_dma_interrupt(&self) -> bool {
        if self.interrupt_feature_offset == 0 {
            return true;
        }
        let status_register = self.interrupt_feature_offset + DFH_INTERRUPT_STATUS_REG_OFFSET;
        match self.translator.bar().read_feature64(status_register) {
            Ok(status) => status & SLOT_DMA_INTERRUPT_BIT != 0,
            Err(e) => {
                error!("{}: cannot read the interrupt feature status: {e}", self.config_name);
                false
            }
        }
    }
}

impl InterruptHandler for DeviceContext {
    fn service_interrupt(&self) {
        if !self.is_slot_dma_interrupt() {
            trace!("{}: not a slot DMA interrupt", self.config_name);
            return;
        }
        let word = self.translator.read_interrupt_status();
        match decode_interrupt_status(word, self.slots.count()) {
            InterruptStatus::Disconnected => error!(
                "{}: interrupt status register is reading {word:#x}, dropping interrupt",
                self.config_name
            ),
            InterruptStatus::Completed { slots, .. } => {
                for slot in slots {
                    self.completions.signal(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfh::tests::management_function;
    use crate::dfh::FunctionType;
    use crate::hardware::dma::{HostDmaAllocator, PAGE_SIZE};
    use crate::hardware::register_space::SimulatedRegisters;
    use crate::registers::register_offset;
    use crate::slots::SlotId;
    use googletest::prelude::*;
    use rstest::*;

    const BAR_LEN: usize = 32 * 1024 * 1024;

    fn geometry() -> SlotGeometry {
        SlotGeometry::new(16, PAGE_SIZE as u32).expect("valid geometry")
    }

    fn gp_offset(index: u32) -> usize {
        register_offset(interp::GENERAL_PURPOSE, index)
    }

    fn attach(regs: &Arc<SimulatedRegisters>) -> Result<DeviceContext, SlotdError> {
        DeviceContext::attach("fpga0", regs.clone(), &HostDmaAllocator::new(), geometry(), false)
    }

    fn signaled(device: &DeviceContext) -> Vec<u32> {
        (0..device.slots().count().get())
            .filter(|&i| {
                let slot = SlotId::new(i, device.slots().count()).expect("slot");
                device.completions().event(slot).is_signaled()
            })
            .collect()
    }

    #[gtest]
    fn reads_endpoint_identity() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        regs.poke32(gp_offset(gp::CHIP_ID_HIGH), 0x1);
        regs.poke32(gp_offset(gp::CHIP_ID_LOW), 0x2);
        regs.poke32(gp_offset(gp::SHELL_IDENTITY), 0x0003_0004);
        regs.poke32(gp_offset(gp::ROLE_ID), 0xcafe);
        let device = attach(&regs).expect("attach");

        expect_that!(device.endpoint().chip_id, eq(0x1_0000_0002));
        expect_that!(device.endpoint().endpoint_number, eq(3));
        expect_that!(device.endpoint().function_number, eq(4));
        expect_that!(device.endpoint().role_id, eq(0xcafe));
        expect_that!(device.name(), eq("4294967298:3:4"));
        expect_that!(device.function().function_type, eq(FunctionType::Legacy));
    }

    #[gtest]
    fn management_function_hands_control_to_the_role() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        management_function(&regs);
        let device = attach(&regs).expect("attach");
        expect_that!(device.function().function_type, eq(FunctionType::Management));
        expect_that!(device.interrupt_feature_offset(), eq(0x100));
    }

    #[gtest]
    fn failed_isolation_releases_the_pool() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        management_function(&regs);
        // Interrupts masked on the role: the read back check fails.
        regs.poke64(0x200 + DFH_ROLE_CONTROL_REG_OFFSET, ROLE_INTERRUPT_MASK_BIT);
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        let result = DeviceContext::attach("fpga0", regs.clone(), &allocator, geometry(), false);
        expect_that!(
            result.map(|_| ()),
            err(displays_as(contains_substring("SlotdError::RoleIsolation")))
        );
        expect_that!(stats.live_buffers(), eq(0));
    }

    #[gtest]
    fn register_info_reports_the_bar() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        let device = attach(&regs).expect("attach");
        expect_that!(
            device.register_info(),
            eq(RegisterInfo {
                region_count: 1,
                region_sizes: [BAR_LEN as u64, 0]
            })
        );
        expect_that!(device.geometry(), eq(geometry()));
    }

    #[gtest]
    #[rstest]
    #[case::single(0x0000_0501, vec![5])]
    #[case::three(0x0302_0103, vec![1, 2, 3])]
    #[case::invalid_dropped(0x0011_0202, vec![2])]
    #[case::disconnected(0xFFFF_FFFF, vec![])]
    #[case::nothing(0x0000_0000, vec![])]
    fn legacy_interrupt_signals_slots(#[case] status: u32, #[case] expected: Vec<u32>) {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        let device = attach(&regs).expect("attach");
        regs.poke32(
            register_offset(interp::INTERRUPT, INTERRUPT_APP_STATUS),
            status,
        );
        device.service_interrupt();
        expect_that!(signaled(&device), eq(&expected));
    }

    #[gtest]
    fn interrupt_feature_gates_slot_dma_interrupts() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        management_function(&regs);
        let device = attach(&regs).expect("attach");
        regs.poke32(
            register_offset(interp::INTERRUPT, INTERRUPT_APP_STATUS),
            0x0000_0701,
        );

        device.service_interrupt();
        expect_that!(signaled(&device), is_empty());

        regs.poke64(0x100 + DFH_INTERRUPT_STATUS_REG_OFFSET, SLOT_DMA_INTERRUPT_BIT);
        device.service_interrupt();
        expect_that!(signaled(&device), elements_are![eq(&7)]);
    }

    #[gtest]
    #[rstest]
    #[case::simulated(DeviceSource::Simulated, true)]
    #[case::missing_resource(DeviceSource::Resource("/nonexistent/resource0".into()), false)]
    fn attaches_from_config(#[case] source: DeviceSource, #[case] attaches: bool) {
        let config = DeviceConfig {
            name: "dev0".to_string(),
            source,
            uio: None,
            avoid_dfh: false,
        };
        let result =
            DeviceContext::attach_configured(&config, geometry(), &HostDmaAllocator::new());
        expect_that!(result.is_ok(), eq(attaches));
    }

    #[gtest]
    fn real_devices_need_device_visible_buffers() {
        let config = DeviceConfig {
            name: "dev0".to_string(),
            source: DeviceSource::Resource("/sys/bus/pci/devices/0000:01:00.0/resource0".into()),
            uio: None,
            avoid_dfh: false,
        };
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        expect_that!(
            DeviceContext::attach_configured(&config, geometry(), &allocator),
            err(displays_as(contains_substring("SlotdError::Unsupported")))
        );
        expect_that!(stats.live_buffers(), eq(0));
    }

    #[gtest]
    fn detach_frees_dma_memory() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        let device =
            DeviceContext::attach("fpga0", regs, &allocator, geometry(), false).expect("attach");
        expect_that!(stats.live_buffers(), gt(0));
        device.detach();
        expect_that!(stats.live_buffers(), eq(0));
    }

    #[gtest]
    fn unregistered_device_is_detached_once_unshared() {
        let regs = Arc::new(SimulatedRegisters::new(BAR_LEN));
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        let device =
            DeviceContext::attach("fpga0", regs, &allocator, geometry(), false).expect("attach");
        let registry = crate::registry::DeviceRegistry::new();
        let handle = registry.insert(Arc::new(device)).expect("insert");

        let device = registry.remove(handle).expect("remove");
        expect_that!(registry.list().map(|devices| devices.len()), ok(eq(&0)));
        Arc::try_unwrap(device).expect("registry no longer shares the device").detach();
        expect_that!(stats.live_buffers(), eq(0));
    }
}
