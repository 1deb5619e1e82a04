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

//! Interrupt delivery.
//!
//! Interrupts are turned into [`InterruptEvent`]s on an [`InterruptLine`] and serviced one at a
//! time by a dispatcher task owned by the device. The events come from a Linux UIO device when one
//! is configured, from a VFIO MSI eventfd on cards bound to `vfio-pci`, or from
//! [`InterruptLine::raise`] in tests and on simulated devices.
//!
//! The UIO protocol: a blocking `read` of 4 bytes returns the running interrupt count, and writing
//! `1u32` re-enables the interrupt. An eventfd `read` returns 8 bytes, the number of interrupts
//! since the previous read, and needs no re-enabling.

use crate::error::SlotdError;
use crate::system_io::fs_open_rw;
use log::{debug, error, info, trace};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Something that can service one interrupt.
pub trait InterruptHandler: Send + Sync + 'static {
    fn service_interrupt(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Running interrupt count reported by the source, 0 when it has none.
    pub count: u32,
}

/// The sending side of a device's interrupt channel.
#[derive(Debug, Clone)]
pub struct InterruptLine {
    tx: mpsc::UnboundedSender<InterruptEvent>,
}

impl InterruptLine {
    /// Deliver an interrupt. Returns false once the dispatcher has stopped.
    pub fn raise(&self, count: u32) -> bool {
        self.tx.send(InterruptEvent { count }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the task that services `handler`'s interrupts.
///
/// The task ends when every [`InterruptLine`] clone has been dropped.
pub fn spawn_dispatcher<H: InterruptHandler>(handler: Arc<H>) -> (InterruptLine, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<InterruptEvent>();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            trace!("Servicing interrupt #{}", event.count);
            handler.service_interrupt();
        }
        debug!("Interrupt dispatcher stopped");
    });
    (InterruptLine { tx }, task)
}

/// Forward the interrupts of a UIO device onto `line`.
///
/// The device is read on a blocking thread. The listener stops when the device returns an error
/// or the dispatcher goes away.
pub fn spawn_uio_listener(
    path: &Path,
    line: InterruptLine,
) -> Result<JoinHandle<()>, SlotdError> {
    let mut uio = fs_open_rw(path)?;
    enable_uio(&mut uio, path)?;
    info!("Listening for interrupts on {path:?}");

    let path: PathBuf = path.into();
    Ok(tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4];
        loop {
            if let Err(e) = uio.read_exact(&mut buf) {
                error!("Reading interrupts from {path:?} failed, listener stopping: {e}");
                return;
            }
            if !line.raise(u32::from_ne_bytes(buf)) {
                debug!("Dispatcher for {path:?} is gone, listener stopping");
                return;
            }
            if let Err(e) = enable_uio(&mut uio, &path) {
                error!("{e}");
                return;
            }
        }
    }))
}

/// Forward the interrupts signalled on `eventfd` onto `line`.
///
/// `name` identifies the source in the log. The listener stops on a read error or when the
/// dispatcher goes away.
pub fn spawn_eventfd_listener(eventfd: OwnedFd, name: String, line: InterruptLine) -> JoinHandle<()> {
    let mut eventfd = File::from(eventfd);
    info!("Listening for interrupts of {name} on an eventfd");
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8];
        let mut total: u32 = 0;
        loop {
            if let Err(e) = eventfd.read_exact(&mut buf) {
                error!("Reading interrupts of {name} failed, listener stopping: {e}");
                return;
            }
            let pending = u64::from_ne_bytes(buf);
            trace!("{name}: {pending} interrupt(s) pending");
            total = total.wrapping_add(pending as u32);
            if !line.raise(total) {
                debug!("Dispatcher for {name} is gone, listener stopping");
                return;
            }
        }
    })
}

fn enable_uio(uio: &mut std::fs::File, path: &Path) -> Result<(), SlotdError> {
    uio.write_all(&1u32.to_ne_bytes())
        .map_err(|e| SlotdError::IOWrite {
            file: path.into(),
            e,
        })
}
