// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The top-level coordinator.
//!
//! The orchestrator keeps a record of every device the inventory has told
//! us about, and runs a discovery agent for exactly those devices that are
//! available, not suppressed, and mastered locally.  Every event that
//! could change one of those conditions funnels through `reconcile()`,
//! which brings the agent for a single device in line with its record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use protocol::ConnectPoint;
use protocol::DeviceId;
use protocol::PortNumber;
use protocol::ProbeError;
use slog::debug;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use tokio::runtime::Handle;

use crate::agent::DeviceAgent;
use crate::config::DiscoveryConfig;
use crate::errors::LinkdError;
use crate::services::DeviceEvent;
use crate::services::InboundPacket;
use crate::services::MastershipEvent;
use crate::services::Services;
use crate::suppression::SuppressionPolicy;
use crate::types::Device;
use crate::types::DeviceMetadata;
use crate::types::DropReason;
use crate::types::LinkdResult;
use crate::types::MastershipRole;
use crate::types::Port;
use crate::types::PortMetadata;

#[derive(Default)]
struct Registry {
    active: bool,
    /// Every device known to inventory, whether or not it has an agent
    devices: BTreeMap<DeviceId, DeviceMetadata>,
    agents: BTreeMap<DeviceId, DeviceAgent>,
}

pub struct Orchestrator {
    log: slog::Logger,
    config: Arc<DiscoveryConfig>,
    policy: SuppressionPolicy,
    services: Services,
    runtime: Handle,
    registry: Mutex<Registry>,
}

impl Orchestrator {
    /// Build an inactive orchestrator.  Must be called from within a tokio
    /// runtime, which will host the probe timers.
    pub fn new(
        log: &slog::Logger,
        config: DiscoveryConfig,
        services: Services,
    ) -> LinkdResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| LinkdError::NoRuntime)?;
        let policy = SuppressionPolicy::new(&config.suppression_key);
        Ok(Orchestrator {
            log: log.new(o!("unit" => "orchestrator")),
            config: Arc::new(config),
            policy,
            services,
            runtime,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Begin discovery on every eligible device in the inventory.
    pub fn start(&self) {
        let mut registry = self.registry.lock().unwrap();
        if registry.active {
            return;
        }
        registry.active = true;
        let devices = self.services.devices.devices();
        info!(self.log, "starting discovery"; "devices" => devices.len());
        for device in devices {
            if self.record_device(&mut registry, &device) {
                self.reconcile(&mut registry, &device.id);
            }
        }
    }

    /// Stop every agent and forget every device.  Events that arrive
    /// afterwards are ignored until the next `start()`.
    pub fn stop(&self) {
        let mut registry = self.registry.lock().unwrap();
        if !registry.active {
            return;
        }
        registry.active = false;
        registry.devices.clear();
        for (_, agent) in std::mem::take(&mut registry.agents) {
            agent.stop();
        }
        info!(self.log, "stopped discovery");
    }

    pub fn is_active(&self) -> bool {
        self.registry.lock().unwrap().active
    }

    /// All running agents, by device.
    pub fn agents(&self) -> BTreeMap<DeviceId, DeviceAgent> {
        self.registry.lock().unwrap().agents.clone()
    }

    pub fn agent_for(&self, device: &DeviceId) -> Option<DeviceAgent> {
        self.registry.lock().unwrap().agents.get(device).cloned()
    }

    pub fn device_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::DeviceAdded(d)
            | DeviceEvent::DeviceUpdated(d)
            | DeviceEvent::DeviceAvailabilityChanged(d) => {
                let mut registry = self.registry.lock().unwrap();
                if !registry.active {
                    return;
                }
                if self.record_device(&mut registry, d) {
                    self.reconcile(&mut registry, &d.id);
                }
            }
            DeviceEvent::DeviceRemoved(d) => {
                let mut registry = self.registry.lock().unwrap();
                if !registry.active {
                    return;
                }
                if registry.devices.remove(&d.id).is_some() {
                    info!(self.log, "device removed";
                        "device" => d.id.to_string());
                }
                self.reconcile(&mut registry, &d.id);
            }
            DeviceEvent::PortAdded(p) | DeviceEvent::PortUpdated(p) => {
                let Some((agent, meta)) = self.port_target(p) else {
                    return;
                };
                if meta.enabled {
                    agent.port_up(&meta);
                } else {
                    agent.port_down(meta.number);
                }
            }
            DeviceEvent::PortRemoved(p) => {
                if let Some((agent, _)) = self.port_target(p) {
                    agent.port_down(p.number);
                }
            }
        }
    }

    /// The set of controllers for a device changed; re-read our role.
    pub fn mastership_event(&self, event: &MastershipEvent) {
        let mut registry = self.registry.lock().unwrap();
        if !registry.active {
            return;
        }
        self.reconcile(&mut registry, &event.device);
    }

    /// Offer a received frame to discovery.  The packet is marked handled
    /// when it was one of our probes; anything else is left for other
    /// consumers.
    pub fn process(&self, packet: &mut InboundPacket) {
        match self.handle_frame(&packet.receive, &packet.data) {
            Ok(()) => {
                packet.block();
            }
            Err(reason) if reason.claims_frame() => {
                packet.block();
            }
            Err(_) => {}
        }
    }

    /// Decode a frame received on `ingress` and route it to the agent for
    /// that device.
    pub fn handle_frame(
        &self,
        ingress: &ConnectPoint,
        frame: &[u8],
    ) -> Result<(), DropReason> {
        let decoded = protocol::decode(frame);
        let agent = self.agent_for(&ingress.device);

        let result = match (decoded, agent) {
            (Err(ProbeError::NotADiscoveryFrame), _) => {
                Err(DropReason::NotADiscoveryFrame)
            }
            (Err(e), Some(agent)) => {
                agent.note_decode_failure(ingress.port, &e);
                Err(DropReason::MalformedFrame)
            }
            (Err(_), None) => Err(DropReason::MalformedFrame),
            (Ok(_), None) => Err(DropReason::UnknownIngressDevice),
            (Ok(probe), Some(agent)) => {
                agent.handle_probe(ingress.port, &probe)
            }
        };
        if let Err(reason) = result {
            trace!(self.log, "dropped frame";
                "ingress" => ingress.to_string(),
                "reason" => reason.to_string());
        }
        result
    }

    // Returns false, leaving the registry untouched, if the device's
    // identity can't be carried in a probe.
    fn record_device(
        &self,
        registry: &mut Registry,
        device: &Device,
    ) -> bool {
        if let Err(e) = protocol::check_identity(&device.id) {
            warn!(self.log, "ignoring device";
                "device" => device.id.to_string(),
                "err" => e.to_string());
            return false;
        }
        let meta = self.policy.device_metadata(device);
        match registry.devices.insert(device.id.clone(), meta.clone()) {
            None => info!(self.log, "device added";
                "device" => device.id.to_string(),
                "available" => meta.available,
                "suppressed" => meta.suppressed),
            Some(old) if old != meta => info!(self.log, "device changed";
                "device" => device.id.to_string(),
                "available" => meta.available,
                "suppressed" => meta.suppressed),
            Some(_) => {}
        }
        true
    }

    // The agent for a port's device, along with the port's discovery
    // state.  None if the device has no running agent.
    fn port_target(&self, port: &Port) -> Option<(DeviceAgent, PortMetadata)> {
        let registry = self.registry.lock().unwrap();
        if !registry.active {
            return None;
        }
        let Some(agent) = registry.agents.get(&port.device) else {
            trace!(self.log, "ignoring port event";
                "port" => port.connect_point().to_string(),
                "reason" => DropReason::UnknownIngressDevice.to_string());
            return None;
        };
        let device_suppressed = registry
            .devices
            .get(&port.device)
            .is_some_and(|d| d.suppressed);
        let meta = self.policy.port_metadata(device_suppressed, port);
        Some((agent.clone(), meta))
    }

    fn port_metadata(&self, meta: &DeviceMetadata) -> Vec<PortMetadata> {
        self.services
            .devices
            .ports(&meta.id)
            .iter()
            .map(|p| self.policy.port_metadata(meta.suppressed, p))
            .collect()
    }

    fn eligible(
        &self,
        registry: &Registry,
        id: &DeviceId,
    ) -> Option<DeviceMetadata> {
        let meta = registry.devices.get(id)?;
        if !meta.available || meta.suppressed {
            return None;
        }
        match self.services.mastership.local_role(id) {
            MastershipRole::Master => Some(meta.clone()),
            role => {
                debug!(self.log, "not master"; "device" => id.to_string(),
                    "role" => format!("{role:?}"));
                None
            }
        }
    }

    // Create, resync, or tear down the agent for one device so that it
    // exists exactly when the device is eligible for discovery.
    fn reconcile(&self, registry: &mut Registry, id: &DeviceId) {
        let eligible = self.eligible(registry, id);
        match (eligible, registry.agents.get(id).cloned()) {
            (Some(meta), None) => {
                let agent = DeviceAgent::new(
                    &self.log,
                    id.clone(),
                    self.config.clone(),
                    self.services.packets.clone(),
                    self.services.links.clone(),
                    self.runtime.clone(),
                );
                agent.start(&self.port_metadata(&meta));
                registry.agents.insert(id.clone(), agent);
            }
            (Some(meta), Some(agent)) => self.resync(&agent, &meta),
            (None, Some(agent)) => {
                registry.agents.remove(id);
                agent.stop();
                info!(self.log, "discovery halted"; "device" => id.to_string());
                self.services.links.links_vanished(id);
            }
            (None, None) => {}
        }
    }

    // Bring a running agent's port set in line with the inventory.
    fn resync(&self, agent: &DeviceAgent, meta: &DeviceMetadata) {
        let ports = self.port_metadata(meta);
        let wanted: Vec<PortNumber> = ports
            .iter()
            .filter(|p| p.is_discoverable())
            .map(|p| p.number)
            .collect();
        let (stale, fresh) = common::purge_common(&agent.ports(), &wanted);
        for number in stale {
            agent.port_down(number);
        }
        for port in ports.iter().filter(|p| fresh.contains(&p.number)) {
            agent.port_up(port);
        }
    }
}
