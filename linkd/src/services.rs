// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The collaborators the discovery engine depends on, and the events they
//! feed into it.

use std::sync::Arc;

use protocol::ConnectPoint;
use protocol::DeviceId;
use tokio::sync::mpsc;

use crate::types::Device;
use crate::types::LinkEvent;
use crate::types::MastershipRole;
use crate::types::Port;

/// Source of truth for devices and their ports.
pub trait DeviceService: Send + Sync {
    fn devices(&self) -> Vec<Device>;
    fn ports(&self, id: &DeviceId) -> Vec<Port>;
}

/// Which controller instance owns which device.
pub trait MastershipService: Send + Sync {
    fn local_role(&self, id: &DeviceId) -> MastershipRole;
}

/// Raw frame transmission.  Must not block: the engine calls this while
/// holding the owning agent's lock.
pub trait PacketService: Send + Sync {
    fn transmit(&self, port: &ConnectPoint, frame: Vec<u8>);
}

/// Consumer of link detected/vanished notifications.
///
/// These are delivered synchronously with engine locks held, so an
/// implementation must not call back into the engine.
pub trait LinkProviderService: Send + Sync {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint);
    fn link_vanished(&self, endpoint: &ConnectPoint);
    fn links_vanished(&self, device: &DeviceId);
}

/// Deliver link notifications into a channel.  The channel is unbounded,
/// so the engine never waits on a slow consumer.  Events sent after the
/// receiver is dropped are discarded.
impl LinkProviderService for mpsc::UnboundedSender<LinkEvent> {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint) {
        let _ = self.send(LinkEvent::Detected {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    fn link_vanished(&self, endpoint: &ConnectPoint) {
        let _ = self.send(LinkEvent::Vanished(endpoint.clone()));
    }

    fn links_vanished(&self, device: &DeviceId) {
        let _ = self.send(LinkEvent::DeviceVanished(device.clone()));
    }
}

/// Handles to every collaborator, injected into the orchestrator when it
/// is built.
#[derive(Clone)]
pub struct Services {
    pub devices: Arc<dyn DeviceService>,
    pub mastership: Arc<dyn MastershipService>,
    pub packets: Arc<dyn PacketService>,
    pub links: Arc<dyn LinkProviderService>,
}

/// Changes reported by the device inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    DeviceAdded(Device),
    DeviceUpdated(Device),
    DeviceRemoved(Device),
    DeviceAvailabilityChanged(Device),
    PortAdded(Port),
    PortUpdated(Port),
    PortRemoved(Port),
}

/// The set of controller instances responsible for a device changed.  The
/// engine re-reads the local role from the mastership service rather than
/// trusting the event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MastershipEvent {
    pub device: DeviceId,
}

/// A frame received from the packet I/O service.
#[derive(Clone, Debug)]
pub struct InboundPacket {
    /// Where the frame arrived
    pub receive: ConnectPoint,
    pub data: Vec<u8>,
    handled: bool,
}

impl InboundPacket {
    pub fn new(receive: ConnectPoint, data: Vec<u8>) -> Self {
        InboundPacket {
            receive,
            data,
            handled: false,
        }
    }

    /// Claim the frame so no other consumer processes it.
    pub fn block(&mut self) -> bool {
        self.handled = true;
        self.handled
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }
}
