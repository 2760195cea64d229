// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The per-port probe schedule.
//!
//! Every discoverable port gets its own tokio task, so ports can be started
//! and stopped independently while all of them share the runtime's worker
//! pool.  The task itself does nothing but tick: each tick asks the owning
//! agent to run one cycle for the port, and the agent does the real work
//! under its own lock.  A cycle transmits one probe and checks whether the
//! port's neighbor has gone quiet.

use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use protocol::DeviceId;
use protocol::PortNumber;
use protocol::ProbeResult;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::types::NeighborRecord;

/// Implemented by whoever owns a set of port timers.
pub(crate) trait PortCycle: Send + Sync {
    /// Run one transmit/aging cycle for the timer identified by
    /// `(port, generation)`.  Must be a no-op if that timer has since been
    /// stopped or replaced.
    fn run_cycle(&self, port: PortNumber, generation: u64);
}

#[derive(Debug)]
struct TimerState {
    stopped: bool,
    sequence: u32,
}

#[derive(Debug)]
pub(crate) struct PortTimer {
    port: PortNumber,
    /// Distinguishes this timer from any earlier or later timer on the same
    /// port, so a tick from a stale task can't drive a newer timer.
    generation: u64,
    aging: Duration,
    state: Mutex<TimerState>,
    task: JoinHandle<()>,
}

impl PortTimer {
    pub fn start(
        runtime: &Handle,
        owner: Weak<dyn PortCycle>,
        port: PortNumber,
        generation: u64,
        interval: Duration,
        aging: Duration,
    ) -> Self {
        let task = runtime.spawn(async move {
            timer_loop(owner, port, generation, interval).await
        });
        PortTimer {
            port,
            generation,
            aging,
            state: Mutex::new(TimerState {
                stopped: false,
                sequence: 0,
            }),
            task,
        }
    }

    pub fn port(&self) -> PortNumber {
        self.port
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Build the next probe for this port, consuming a sequence number.
    /// Returns None once the timer has been stopped.
    pub fn next_probe(
        &self,
        device: &DeviceId,
        nonce: u64,
    ) -> Option<ProbeResult<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return None;
        }
        let sequence = state.sequence;
        state.sequence = sequence.wrapping_add(1);
        Some(protocol::encode(device, self.port, nonce, sequence))
    }

    /// Has `neighbor` gone without a refresh for longer than the aging
    /// timeout?  A stopped timer never reports an expiry.
    pub fn neighbor_expired(
        &self,
        neighbor: Option<&NeighborRecord>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state.lock().unwrap().stopped {
            return false;
        }
        neighbor.is_some_and(|n| match (now - n.last_seen).to_std() {
            Ok(age) => age > self.aging,
            // last_seen is in the future
            Err(_) => false,
        })
    }

    /// Stop the timer.  Once this returns, no further probe will be built
    /// and no further expiry reported.  Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

impl Drop for PortTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn timer_loop(
    owner: Weak<dyn PortCycle>,
    port: PortNumber,
    generation: u64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(owner) = owner.upgrade() else {
            break;
        };
        owner.run_cycle(port, generation);
    }
}
