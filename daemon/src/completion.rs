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

//! Per-slot completion signalling.
//!
//! Each slot has a binary [`CompletionEvent`]. The interrupt path signals it, a client resets it
//! explicitly before submitting new work, and waiting never changes it. A wait can be bounded by
//! a timeout and is cut short when the waiting session is cancelled.
//!
//! The card reports finished slots in one coalesced status word, decoded by
//! [`decode_interrupt_status`].

use crate::error::SlotdError;
use crate::slots::{SlotCount, SlotId};
use log::{error, trace};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// How a wait behaves when the event is not yet signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return `WouldBlock` immediately.
    Poll,
    /// Wait until signalled or cancelled.
    Block,
    /// Wait until signalled or cancelled, failing with `Timeout` after the duration.
    BlockFor(Duration),
}

impl WaitMode {
    /// Build the mode for a client request. A zero timeout means wait forever.
    pub fn from_request(timeout_ms: u32, wait: bool) -> WaitMode {
        match (wait, timeout_ms) {
            (false, _) => WaitMode::Poll,
            (true, 0) => WaitMode::Block,
            (true, ms) => WaitMode::BlockFor(Duration::from_millis(u64::from(ms))),
        }
    }
}

/// Cancels every wait made with its [`Cancellation`] tokens.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl CancelHandle {
    pub fn new() -> CancelHandle {
        let (tx, _) = watch::channel(false);
        CancelHandle { tx }
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A binary event that stays signalled until reset.
#[derive(Debug)]
pub struct CompletionEvent {
    state: watch::Sender<bool>,
}

impl Default for CompletionEvent {
    fn default() -> Self {
        CompletionEvent::new()
    }
}

impl CompletionEvent {
    pub fn new() -> CompletionEvent {
        let (state, _) = watch::channel(false);
        CompletionEvent { state }
    }

    pub fn signal(&self) {
        self.state.send_replace(true);
    }

    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait(&self, mode: WaitMode, cancel: &Cancellation) -> Result<(), SlotdError> {
        match mode {
            WaitMode::Poll if self.is_signaled() => Ok(()),
            WaitMode::Poll => Err(SlotdError::WouldBlock(
                "slot event is not signaled".to_string(),
            )),
            WaitMode::Block => self.wait_signaled(cancel).await,
            WaitMode::BlockFor(limit) => timeout(limit, self.wait_signaled(cancel))
                .await
                .map_err(|_| {
                    SlotdError::Timeout(format!(
                        "slot event not signaled within {} ms",
                        limit.as_millis()
                    ))
                })?,
        }
    }

    async fn wait_signaled(&self, cancel: &Cancellation) -> Result<(), SlotdError> {
        let mut state = self.state.subscribe();
        let mut cancelled = cancel.rx.clone();
        tokio::select! {
            signaled = state.wait_for(|signaled| *signaled) => signaled
                .map(|_| ())
                .map_err(|_| SlotdError::Internal("slot event was dropped".to_string())),
            _ = cancelled.wait_for(|cancelled| *cancelled) => Err(SlotdError::Interrupted(
                "wait cancelled because the session closed".to_string(),
            )),
        }
    }
}

/// One [`CompletionEvent`] per slot.
#[derive(Debug)]
pub struct CompletionSet {
    events: Vec<CompletionEvent>,
}

impl CompletionSet {
    pub fn new(count: SlotCount) -> CompletionSet {
        CompletionSet {
            events: (0..count.get()).map(|_| CompletionEvent::new()).collect(),
        }
    }

    pub fn event(&self, slot: SlotId) -> &CompletionEvent {
        &self.events[slot.index()]
    }

    pub fn signal(&self, slot: SlotId) {
        trace!("Signalling slot {slot}");
        self.event(slot).signal();
    }

    pub fn reset(&self, slot: SlotId) {
        self.event(slot).reset();
    }

    pub async fn wait(
        &self,
        slot: SlotId,
        mode: WaitMode,
        cancel: &Cancellation,
    ) -> Result<(), SlotdError> {
        self.event(slot).wait(mode, cancel).await
    }
}

/// What the interrupt status word says happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptStatus {
    /// The register read all ones: the card is gone or in reset.
    Disconnected,
    /// Up to three slots finished. Ids at or above the slot count are reported separately.
    Completed { slots: Vec<SlotId>, dropped: Vec<u32> },
}

/// Decode the coalesced interrupt status word.
///
/// The low two bits give the number of completions (0 to 3). Completed slot ids follow one per
/// byte, starting at bit 8.
pub fn decode_interrupt_status(word: u32, count: SlotCount) -> InterruptStatus {
    if word == u32::MAX {
        return InterruptStatus::Disconnected;
    }
    let mut slots = Vec::new();
    let mut dropped = Vec::new();
    for i in 1..=(word & 3) {
        let id = (word >> (8 * i)) & 0xff;
        match SlotId::new(id, count) {
            Ok(slot) => slots.push(slot),
            Err(_) => {
                error!("Interrupt reports completion on invalid slot {id}, dropping it");
                dropped.push(id);
            }
        }
    }
    InterruptStatus::Completed { slots, dropped }
}
