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

mod common;

use common::Rig;
use googletest::prelude::*;
use rstest::*;
use slotd::interrupts::spawn_dispatcher;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const CLIENT: &str = ":1.20";

async fn poll(rig: &Rig, session: u64, slot: u32) -> bool {
    rig.service
        .wait_slot_event(session, CLIENT, slot, 0, false)
        .await
        .is_ok()
}

#[gtest]
#[rstest]
#[case::single(0x0000_0501, vec![5])]
#[case::three(0x0302_0103, vec![1, 2, 3])]
#[case::disconnected(0xFFFF_FFFF, vec![])]
#[tokio::test]
async fn interrupt_signals_exactly_the_reported_slots(
    #[case] status: u32,
    #[case] expected: Vec<u32>,
) {
    let rig = Rig::new(8);
    let session = rig.open(100, CLIENT);
    let (line, dispatcher) = spawn_dispatcher(rig.device.clone());

    rig.set_interrupt_status(status);
    expect_that!(line.raise(1), eq(true));
    drop(line);
    dispatcher.await.expect("dispatcher panicked");

    let mut signaled = Vec::new();
    for slot in 0..8 {
        if poll(&rig, session, slot).await {
            signaled.push(slot);
        }
    }
    expect_that!(signaled, eq(&expected));
}

#[gtest]
#[tokio::test]
async fn blocked_waiter_wakes_on_interrupt() {
    let rig = Rig::new(8);
    let session = rig.open(100, CLIENT);
    let slot = rig.service.acquire_slot(session, CLIENT).expect("acquire");
    let (line, _dispatcher) = spawn_dispatcher(rig.device.clone());

    let waiter = {
        let service = rig.service.clone();
        tokio::spawn(async move {
            service
                .wait_slot_event(session, CLIENT, slot, 5000, true)
                .await
        })
    };
    sleep(Duration::from_millis(10)).await;
    rig.set_interrupt_status(slot << 8 | 1);
    line.raise(1);

    let result = waiter.await.expect("waiter panicked");
    expect_that!(result, ok(eq(&())));
}

#[gtest]
#[tokio::test]
async fn wait_stays_signaled_until_reset() {
    let rig = Rig::new(4);
    let session = rig.open(100, CLIENT);
    rig.service
        .complete_slot_event(session, CLIENT, 2)
        .expect("complete");

    for _ in 0..3 {
        expect_that!(
            rig.service.wait_slot_event(session, CLIENT, 2, 0, true).await,
            ok(eq(&()))
        );
    }
    rig.service
        .reset_slot_event(session, CLIENT, 2)
        .expect("reset");
    expect_that!(poll(&rig, session, 2).await, eq(false));
}

#[gtest]
#[tokio::test]
async fn poll_returns_would_block_immediately() {
    let rig = Rig::new(4);
    let session = rig.open(100, CLIENT);
    let start = Instant::now();
    expect_that!(
        rig.service.wait_slot_event(session, CLIENT, 0, 1000, false).await,
        err(displays_as(contains_substring("SlotdError::WouldBlock")))
    );
    expect_that!(start.elapsed(), lt(Duration::from_millis(100)));
}

#[gtest]
#[tokio::test]
async fn bounded_wait_times_out_after_the_limit() {
    let rig = Rig::new(4);
    let session = rig.open(100, CLIENT);
    let limit = Duration::from_millis(100);
    let start = Instant::now();
    let result = rig
        .service
        .wait_slot_event(session, CLIENT, 0, 100, true)
        .await;
    let elapsed = start.elapsed();
    expect_that!(
        result,
        err(displays_as(contains_substring("SlotdError::Timeout")))
    );
    expect_that!(elapsed, ge(limit));
    expect_that!(elapsed, lt(limit + Duration::from_millis(500)));
}

#[gtest]
#[tokio::test]
async fn departing_client_interrupts_its_waits() {
    let rig = Rig::new(4);
    let session = rig.open(100, CLIENT);
    let waiter = {
        let service = rig.service.clone();
        tokio::spawn(async move { service.wait_slot_event(session, CLIENT, 1, 0, true).await })
    };
    sleep(Duration::from_millis(10)).await;
    rig.service.close_sessions_of(CLIENT).expect("close");
    let result = waiter.await.expect("waiter panicked");
    expect_that!(
        result,
        err(displays_as(contains_substring("SlotdError::Interrupted")))
    );
}
