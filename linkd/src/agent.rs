// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Link discovery for a single device.
//!
//! An agent owns one probe timer per discoverable port and the table of
//! neighbors seen on those ports.  All of that state sits behind a single
//! per-agent lock, which is held for the whole of every timer cycle,
//! inbound probe, and lifecycle operation.  Stopping a timer while holding
//! that lock therefore guarantees the timer has no cycle in flight and will
//! never run another.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use protocol::ConnectPoint;
use protocol::DeviceId;
use protocol::DiscoveryProbe;
use protocol::PortNumber;
use protocol::ProbeError;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use tokio::runtime::Handle;

use crate::config::DiscoveryConfig;
use crate::services::LinkProviderService;
use crate::services::PacketService;
use crate::timer::PortCycle;
use crate::timer::PortTimer;
use crate::types::DropReason;
use crate::types::NeighborRecord;
use crate::types::PortMetadata;
use crate::types::Stats;

/// Handle to the discovery agent for one device.  Clones share the same
/// agent, and two handles compare equal when they refer to the same agent.
#[derive(Clone)]
pub struct DeviceAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    log: slog::Logger,
    device: DeviceId,
    config: Arc<DiscoveryConfig>,
    packets: Arc<dyn PacketService>,
    links: Arc<dyn LinkProviderService>,
    runtime: Handle,
    state: Mutex<AgentState>,
}

#[derive(Default)]
struct AgentState {
    stopped: bool,
    /// Chosen afresh each time the agent starts
    nonce: u64,
    next_generation: u64,
    timers: BTreeMap<PortNumber, PortTimer>,
    neighbors: BTreeMap<PortNumber, NeighborRecord>,
    /// Consecutive malformed probes per port, for rate-limited logging
    decode_failures: BTreeMap<PortNumber, u64>,
    stats: Stats,
}

impl PartialEq for DeviceAgent {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DeviceAgent {}

impl std::fmt::Debug for DeviceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceAgent")
            .field("device", &self.inner.device)
            .field("stopped", &self.is_stopped())
            .field("ports", &self.ports())
            .finish()
    }
}

impl DeviceAgent {
    /// Build an agent for `device`.  The agent does nothing until started.
    pub(crate) fn new(
        log: &slog::Logger,
        device: DeviceId,
        config: Arc<DiscoveryConfig>,
        packets: Arc<dyn PacketService>,
        links: Arc<dyn LinkProviderService>,
        runtime: Handle,
    ) -> Self {
        let log = log.new(slog::o!(
            "unit" => "agent",
            "device" => device.to_string()));
        let state = AgentState {
            stopped: true,
            ..Default::default()
        };
        DeviceAgent {
            inner: Arc::new(AgentInner {
                log,
                device,
                config,
                packets,
                links,
                runtime,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().unwrap().stopped
    }

    /// Is a probe timer running for this port?
    pub fn contains_port(&self, port: PortNumber) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .timers
            .get(&port)
            .is_some_and(|t| !t.is_stopped())
    }

    /// All ports with a running probe timer, in ascending order.
    pub fn ports(&self) -> Vec<PortNumber> {
        self.inner.state.lock().unwrap().timers.keys().copied().collect()
    }

    /// The neighbor currently recorded on each local port.
    pub fn neighbors(&self) -> BTreeMap<PortNumber, NeighborRecord> {
        self.inner.state.lock().unwrap().neighbors.clone()
    }

    pub fn stats(&self) -> Stats {
        self.inner.state.lock().unwrap().stats.clone()
    }

    /// Begin running, with a probe timer on every discoverable port in
    /// `ports`.  A no-op if the agent is already running.
    pub(crate) fn start(&self, ports: &[PortMetadata]) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.stopped {
            trace!(self.inner.log, "already running");
            return;
        }
        state.stopped = false;
        state.nonce = common::random_nonce();
        for port in ports.iter().filter(|p| p.is_discoverable()) {
            self.add_timer(&mut state, port.number);
        }
        info!(self.inner.log, "discovery started";
            "ports" => ?state.timers.keys().collect::<Vec<_>>());
    }

    /// Bring the port's probe timer in line with its current state.  A
    /// discoverable port gets a timer if it doesn't already have one.  Any
    /// other port loses its timer, and its link vanishes if a neighbor had
    /// been seen on it.
    pub(crate) fn port_up(&self, port: &PortMetadata) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        if state.stopped {
            trace!(self.inner.log, "ignoring port update";
                "port" => port.number,
                "reason" => DropReason::StaleAgentOperation.to_string());
            return;
        }

        if port.is_discoverable() {
            if !state.timers.contains_key(&port.number) {
                info!(self.inner.log, "port added"; "port" => port.number);
                self.add_timer(state, port.number);
            }
        } else if self.inner.remove_port(state, port.number) {
            self.inner.vanish(port.number);
        }
    }

    /// Stop probing on a port that has gone down or been removed, and
    /// report any link on it as gone.
    pub(crate) fn port_down(&self, port: PortNumber) {
        let mut state = self.inner.state.lock().unwrap();
        if state.stopped {
            trace!(self.inner.log, "ignoring port down";
                "port" => port,
                "reason" => DropReason::StaleAgentOperation.to_string());
            return;
        }
        self.inner.remove_port(&mut state, port);
        info!(self.inner.log, "port removed"; "port" => port);
        self.inner.vanish(port);
    }

    /// Match a probe received on `ingress` against the neighbor table.
    pub(crate) fn handle_probe(
        &self,
        ingress: PortNumber,
        probe: &DiscoveryProbe,
    ) -> Result<(), DropReason> {
        self.inner.handle_probe_at(ingress, probe, Utc::now())
    }

    /// Account for a frame on `port` that failed to decode.
    pub(crate) fn note_decode_failure(
        &self,
        port: PortNumber,
        err: &ProbeError,
    ) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        if state.stopped {
            return;
        }
        state.stats.frames_in_total += 1;
        state.stats.frames_in_errors_total += 1;
        let count = state.decode_failures.entry(port).or_insert(0);
        *count += 1;
        if *count == 1 || *count % self.inner.config.decode_log_every == 0 {
            debug!(self.inner.log, "dropping malformed probe";
                "port" => port,
                "count" => *count,
                "err" => err.to_string());
        }
    }

    /// Stop every timer and forget every neighbor.  No per-port vanish
    /// events are raised; the caller reports the device as a whole.
    /// Idempotent.
    pub(crate) fn stop(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        if state.stopped {
            return;
        }
        state.stopped = true;
        for timer in std::mem::take(&mut state.timers).into_values() {
            timer.stop();
            debug!(self.inner.log, "stopped probe timer";
                "port" => timer.port());
        }
        state.neighbors.clear();
        state.decode_failures.clear();
        info!(self.inner.log, "discovery stopped");
    }

    fn add_timer(&self, state: &mut AgentState, port: PortNumber) {
        let generation = state.next_generation;
        state.next_generation += 1;
        let owner: Weak<dyn PortCycle> =
            Arc::downgrade(&self.inner) as Weak<dyn PortCycle>;
        let timer = PortTimer::start(
            &self.inner.runtime,
            owner,
            port,
            generation,
            self.inner.config.probe_interval(),
            self.inner.config.aging_timeout(),
        );
        if let Some(old) = state.timers.insert(port, timer) {
            old.stop();
        }
    }

    #[cfg(test)]
    fn generation(&self, port: PortNumber) -> Option<u64> {
        self.inner
            .state
            .lock()
            .unwrap()
            .timers
            .get(&port)
            .map(|t| t.generation())
    }
}

impl AgentInner {
    fn local(&self, port: PortNumber) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), port)
    }

    fn vanish(&self, port: PortNumber) {
        self.links.link_vanished(&self.local(port));
    }

    // Stop the port's timer and drop its neighbor.  Returns true if there
    // was a neighbor to drop.
    fn remove_port(&self, state: &mut AgentState, port: PortNumber) -> bool {
        if let Some(timer) = state.timers.remove(&port) {
            timer.stop();
        }
        state.decode_failures.remove(&port);
        state.neighbors.remove(&port).is_some()
    }

    fn handle_probe_at(
        &self,
        ingress: PortNumber,
        probe: &DiscoveryProbe,
        now: DateTime<Utc>,
    ) -> Result<(), DropReason> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.stopped {
            return Err(DropReason::StaleAgentOperation);
        }
        state.stats.frames_in_total += 1;

        // A probe we sent came back to us over a loop or a non-switch path.
        if probe.device == self.device || probe.nonce == state.nonce {
            trace!(self.log, "ignoring our own probe";
                "port" => ingress, "from" => probe.source().to_string());
            state.stats.frames_discarded_total += 1;
            return Err(DropReason::SelfProbe);
        }
        if !state.timers.contains_key(&ingress) {
            trace!(self.log, "probe on untracked port"; "port" => ingress);
            state.stats.frames_discarded_total += 1;
            return Err(DropReason::UntrackedPort);
        }
        state.decode_failures.remove(&ingress);

        let remote = probe.source();
        let local = self.local(ingress);
        match state.neighbors.entry(ingress) {
            Entry::Vacant(e) => {
                info!(self.log, "new neighbor";
                    "port" => ingress, "remote" => remote.to_string());
                e.insert(NeighborRecord::new(remote.clone(), now));
                self.links.link_detected(&remote, &local);
            }
            Entry::Occupied(e) => {
                let old = e.into_mut();
                old.last_seen = now;
                if old.remote != remote {
                    info!(self.log, "neighbor changed";
                        "port" => ingress,
                        "old" => old.remote.to_string(),
                        "new" => remote.to_string());
                    old.remote = remote.clone();
                    old.last_changed = now;
                    self.links.link_detected(&remote, &local);
                } else {
                    trace!(self.log, "refresh neighbor";
                        "port" => ingress, "sequence" => probe.sequence);
                }
            }
        }
        Ok(())
    }

    fn cycle_at(&self, port: PortNumber, generation: u64, now: DateTime<Utc>) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.stopped {
            return;
        }
        let Some(timer) = state.timers.get(&port) else {
            return;
        };
        if timer.generation() != generation {
            return;
        }

        match timer.next_probe(&self.device, state.nonce) {
            None => return,
            Some(Ok(frame)) => {
                self.packets.transmit(&self.local(port), frame);
                state.stats.frames_out_total += 1;
            }
            Some(Err(e)) => {
                error!(self.log, "failed to build probe";
                    "port" => port, "err" => e.to_string());
            }
        }

        if timer.neighbor_expired(state.neighbors.get(&port), now) {
            if let Some(n) = state.neighbors.remove(&port) {
                info!(self.log, "neighbor aged out";
                    "port" => port,
                    "remote" => n.remote.to_string(),
                    "last_seen" => n.last_seen.to_rfc3339());
                state.stats.ageouts_total += 1;
                self.vanish(port);
            }
        }
    }
}

impl PortCycle for AgentInner {
    fn run_cycle(&self, port: PortNumber, generation: u64) {
        self.cycle_at(port, generation, Utc::now())
    }
}
