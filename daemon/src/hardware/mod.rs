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

//! Access to the card itself.
//!
//! Everything that touches memory shared with the accelerator lives below this module:
//! - [`register_space`] - the register BAR, either a real `mmap`ed PCI resource or an in-memory
//!   simulation, always reached through the bounds-checked [`register_space::Bar`].
//! - [`dma`] - host memory the card can DMA into, handed out with a bus address.
//! - [`vfio`] - the IOMMU container that makes those bus addresses real, and MSI delivery.

pub mod dma;
pub mod register_space;
pub mod vfio;
