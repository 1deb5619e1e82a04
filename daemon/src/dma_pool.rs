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

//! Per-device DMA memory.
//!
//! Every slot gets one input and one output buffer of `bytes_per_slot` bytes. Two further regions
//! are shared by all slots and striped per slot: the control region (64 bytes per slot) and the
//! result region (128 bytes per slot). The bus addresses are published to the card once, at
//! initialisation, and the pool lives until the device is detached.

use crate::config::SlotGeometry;
use crate::error::SlotdError;
use crate::hardware::dma::{DmaAllocator, DmaBuffer};
use crate::registers::RegisterTranslator;
use crate::shell::*;
use crate::slots::SlotId;
use log::{debug, info, warn};

/// Upper bound on reads of the interrupt status register while flushing stale interrupts.
pub const MAX_INTERRUPT_DRAIN_READS: usize = 1024;

/// Default TX engine payload size setting (128 bytes).
pub const DEFAULT_MAX_PAYLOAD: u32 = 0;

/// Number of completions the card coalesces into one interrupt.
pub const DEFAULT_INTERRUPT_COALESCE: u32 = 1;

#[derive(Debug)]
struct SlotBuffers {
    input: DmaBuffer,
    output: DmaBuffer,
}

/// Sizes and bus addresses of the four DMA regions, as reported to clients.
///
/// The input and output bus addresses are those of slot 0; the sizes cover every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPointers {
    pub input_size: u64,
    pub input_bus: u64,
    pub output_size: u64,
    pub output_bus: u64,
    pub control_size: u64,
    pub control_bus: u64,
    pub result_size: u64,
    pub result_bus: u64,
}

#[derive(Debug)]
pub struct DmaPool {
    slots: Vec<SlotBuffers>,
    control: DmaBuffer,
    result: DmaBuffer,
    bytes_per_slot: usize,
}

impl DmaPool {
    /// Allocate every buffer, publish the bus addresses and put the card's DMA engine in a known
    /// state.
    ///
    /// Allocation is all-or-nothing: if any buffer cannot be allocated, every buffer allocated so
    /// far is released before the error is returned.
    pub fn init(
        translator: &RegisterTranslator,
        allocator: &dyn DmaAllocator,
        geometry: SlotGeometry,
    ) -> Result<DmaPool, SlotdError> {
        let slot_count = geometry.slot_count as usize;
        let bytes_per_slot = geometry.bytes_per_slot as usize;

        let slots = (0..slot_count)
            .map(|_| -> Result<SlotBuffers, SlotdError> {
                Ok(SlotBuffers {
                    input: allocator.allocate(bytes_per_slot)?,
                    output: allocator.allocate(bytes_per_slot)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let control = allocator.allocate(slot_count * FPGA_CONTROL_SIZE)?;
        let result = allocator.allocate(slot_count * FPGA_RESULT_SIZE)?;

        let pool = DmaPool {
            slots,
            control,
            result,
            bytes_per_slot,
        };
        pool.publish(translator)?;
        drain_interrupts(translator);

        translator.write(
            interp::OVERRIDE_OUT_DATA_SIZE,
            OVERRIDE_APP_MAX_PAYLOAD,
            DEFAULT_MAX_PAYLOAD,
        );
        translator.write(
            interp::INTERRUPT,
            INTERRUPT_APP_COALESCE,
            DEFAULT_INTERRUPT_COALESCE,
        );

        info!(
            "DMA pool ready: {slot_count} slots of {bytes_per_slot:#x} bytes, result region at {:#x}",
            pool.result.bus_address()
        );
        Ok(pool)
    }

    fn publish(&self, translator: &RegisterTranslator) -> Result<(), SlotdError> {
        let bar = translator.bar();
        for (i, slot) in self.slots.iter().enumerate() {
            let stride = i * DMA_SLOT_STRIDE;
            bar.write64(DMA_SLOT_INPUT_BASE_ADDRESS + stride, slot.input.bus_address())?;
            bar.write64(DMA_SLOT_OUTPUT_BASE_ADDRESS + stride, slot.output.bus_address())?;
            bar.write64(
                DMA_SLOT_CONTROL_RESULT_BASE_ADDRESS + stride,
                self.result.bus_address() + (i * FPGA_RESULT_SIZE) as u64,
            )?;
        }
        debug!("Published bus addresses for {} slots", self.slots.len());
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes_per_slot(&self) -> usize {
        self.bytes_per_slot
    }

    pub fn input(&self, slot: SlotId) -> &DmaBuffer {
        &self.slots[slot.index()].input
    }

    pub fn output(&self, slot: SlotId) -> &DmaBuffer {
        &self.slots[slot.index()].output
    }

    pub fn control(&self) -> &DmaBuffer {
        &self.control
    }

    pub fn result(&self) -> &DmaBuffer {
        &self.result
    }

    pub fn buffer_pointers(&self) -> BufferPointers {
        let total = (self.slots.len() * self.bytes_per_slot) as u64;
        let first = self.slots.first();
        BufferPointers {
            input_size: total,
            input_bus: first.map_or(0, |s| s.input.bus_address()),
            output_size: total,
            output_bus: first.map_or(0, |s| s.output.bus_address()),
            control_size: (self.slots.len() * FPGA_CONTROL_SIZE) as u64,
            control_bus: self.control.bus_address(),
            result_size: (self.slots.len() * FPGA_RESULT_SIZE) as u64,
            result_bus: self.result.bus_address(),
        }
    }

    /// Release every buffer.
    pub fn teardown(self) {
        info!("Releasing DMA pool of {} slots", self.slots.len());
    }
}

/// Flush interrupts left over from a previous owner of the card.
fn drain_interrupts(translator: &RegisterTranslator) {
    for _ in 0..MAX_INTERRUPT_DRAIN_READS {
        let status = translator.read_interrupt_status();
        if status == u32::MAX {
            warn!("Interrupt status reads all ones while draining, is the device present?");
            return;
        }
        if status & 3 == 0 {
            return;
        }
        debug!("Drained stale interrupt status {status:#010x}");
    }
    warn!("Interrupt status still pending after {MAX_INTERRUPT_DRAIN_READS} reads");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::dma::{HostDmaAllocator, PAGE_SIZE};
    use crate::hardware::register_space::{Bar, SimulatedRegisters};
    use crate::registers::register_offset;
    use crate::slots::SlotCount;
    use googletest::prelude::*;
    use std::sync::Arc;

    fn translator() -> (Arc<SimulatedRegisters>, RegisterTranslator) {
        let regs = Arc::new(SimulatedRegisters::new(32 * 1024 * 1024));
        (regs.clone(), RegisterTranslator::new(Bar::new(regs)))
    }

    fn geometry(slots: u32) -> SlotGeometry {
        SlotGeometry::new(slots, PAGE_SIZE as u32).expect("valid geometry")
    }

    #[gtest]
    fn publishes_per_slot_bus_addresses() {
        let (regs, t) = translator();
        let allocator = HostDmaAllocator::new();
        let pool = DmaPool::init(&t, &allocator, geometry(4)).expect("pool");
        let count = SlotCount::new(4).expect("count");

        for i in 0..4 {
            let slot = SlotId::new(i, count).expect("slot");
            let stride = i as usize * DMA_SLOT_STRIDE;
            expect_that!(
                regs.peek64(DMA_SLOT_INPUT_BASE_ADDRESS + stride),
                eq(pool.input(slot).bus_address())
            );
            expect_that!(
                regs.peek64(DMA_SLOT_OUTPUT_BASE_ADDRESS + stride),
                eq(pool.output(slot).bus_address())
            );
            expect_that!(
                regs.peek64(DMA_SLOT_CONTROL_RESULT_BASE_ADDRESS + stride),
                eq(pool.result().bus_address() + i as u64 * FPGA_RESULT_SIZE as u64)
            );
        }
    }

    #[gtest]
    fn programs_payload_then_coalescing_after_publishing() {
        let (regs, t) = translator();
        let allocator = HostDmaAllocator::new();
        let _pool = DmaPool::init(&t, &allocator, geometry(2)).expect("pool");

        let log = regs.write_log();
        let packed: Vec<u64> = log[log.len() - 2..].iter().map(|(_, v)| *v).collect();
        expect_that!(
            packed,
            elements_are![
                eq(&((register_offset(interp::OVERRIDE_OUT_DATA_SIZE, OVERRIDE_APP_MAX_PAYLOAD)
                    as u64)
                    << 32)),
                eq(&((register_offset(interp::INTERRUPT, INTERRUPT_APP_COALESCE) as u64) << 32
                    | 1))
            ]
        );
    }

    #[gtest]
    fn buffer_pointers_cover_every_slot() {
        let (_, t) = translator();
        let allocator = HostDmaAllocator::new();
        let pool = DmaPool::init(&t, &allocator, geometry(8)).expect("pool");
        let pointers = pool.buffer_pointers();
        expect_that!(pointers.input_size, eq(8 * PAGE_SIZE as u64));
        expect_that!(pointers.control_size, eq(8 * 64));
        expect_that!(pointers.result_size, eq(8 * 128));
        expect_that!(pointers.result_bus, eq(pool.result().bus_address()));
    }

    #[gtest]
    fn failed_allocation_releases_everything() {
        let (regs, t) = translator();
        // Enough for every slot buffer but not the shared regions.
        let allocator = HostDmaAllocator::with_budget(4 * 2 * PAGE_SIZE);
        let stats = allocator.stats();
        expect_that!(
            DmaPool::init(&t, &allocator, geometry(4)).map(|_| ()),
            err(displays_as(contains_substring("SlotdError::DmaAllocation")))
        );
        expect_that!(stats.live_buffers(), eq(0));
        expect_that!(stats.live_bytes(), eq(0));
        expect_that!(regs.write_log(), is_empty());
    }

    #[gtest]
    fn teardown_frees_all_buffers() {
        let (_, t) = translator();
        let allocator = HostDmaAllocator::new();
        let stats = allocator.stats();
        let pool = DmaPool::init(&t, &allocator, geometry(3)).expect("pool");
        expect_that!(stats.live_buffers(), eq(3 * 2 + 2));
        pool.teardown();
        expect_that!(stats.live_buffers(), eq(0));
    }

    #[gtest]
    fn pending_interrupt_status_does_not_hang_init() {
        let (regs, t) = translator();
        regs.poke32(
            register_offset(interp::INTERRUPT, INTERRUPT_APP_STATUS),
            0x0000_0501,
        );
        let allocator = HostDmaAllocator::new();
        expect_that!(
            DmaPool::init(&t, &allocator, geometry(2)).map(|_| ()),
            ok(eq(&()))
        );
    }
}
