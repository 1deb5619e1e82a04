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

//! slotd - share the DMA slots of an FPGA accelerator between cooperating processes.
//!
//! The daemon carves each attached card's DMA memory into fixed-size slots. A client opens a
//! session on a device, reserves slots, maps their buffers, submits work and waits for the card to
//! report completion. The pieces, leaf first:
//!
//! - [`registers`]: logical `(interp, app)` register addresses to BAR accesses
//! - [`dfh`]: the device feature header walk and role hand-over
//! - [`dma_pool`]: per-slot input/output buffers and the shared control/result regions
//! - [`slots`]: exclusive per-process slot ownership
//! - [`completion`] and [`interrupts`]: per-slot completion events driven by the card's interrupt
//! - [`session`], [`mapping`] and [`comm`]: the client-facing surface over DBus

pub mod attributes;
pub mod comm;
pub mod completion;
pub mod config;
pub mod device;
pub mod dfh;
pub mod dma_pool;
pub mod error;
pub mod hardware;
pub mod interrupts;
pub mod mapping;
pub mod registers;
pub mod registry;
pub mod session;
pub mod shell;
pub mod slots;
pub mod system_io;
