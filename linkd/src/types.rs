// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use protocol::ConnectPoint;
use protocol::DeviceId;
use protocol::PortNumber;

use crate::errors;

pub type LinkdResult<T> = Result<T, errors::LinkdError>;

/// Free-form key/value annotations attached to inventory objects.
pub type Annotations = BTreeMap<String, String>;

/// A switch, as reported by the device inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Whether the inventory currently considers the device reachable
    pub available: bool,
    pub annotations: Annotations,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Device {
            id: id.into(),
            available: true,
            annotations: Annotations::new(),
        }
    }

    pub fn with_annotation(
        mut self,
        key: impl ToString,
        value: impl ToString,
    ) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

/// A port on a switch, as reported by the device inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    /// Device the port belongs to
    pub device: DeviceId,
    pub number: PortNumber,
    pub enabled: bool,
    pub annotations: Annotations,
}

impl Port {
    pub fn new(
        device: impl Into<DeviceId>,
        number: PortNumber,
        enabled: bool,
    ) -> Self {
        Port {
            device: device.into(),
            number,
            enabled,
            annotations: Annotations::new(),
        }
    }

    pub fn with_annotation(
        mut self,
        key: impl ToString,
        value: impl ToString,
    ) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn connect_point(&self) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), self.number)
    }
}

/// The discovery-relevant facts about a device, computed once when an
/// inventory event is ingested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub id: DeviceId,
    pub available: bool,
    pub suppressed: bool,
}

/// The discovery-relevant facts about a port.  `suppressed` already folds
/// in the suppression state of the owning device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMetadata {
    pub number: PortNumber,
    pub enabled: bool,
    pub suppressed: bool,
}

impl PortMetadata {
    /// Should this port be sending probes?
    pub fn is_discoverable(&self) -> bool {
        self.enabled && !self.suppressed
    }
}

/// This controller instance's role for a given device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MastershipRole {
    Master,
    Standby,
    #[default]
    None,
}

/// The far end of a link, as last confirmed by a probe received on one of
/// our ports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborRecord {
    /// Uuid assigned when the neighbor was first seen
    pub id: uuid::Uuid,
    /// The device and port that sent the probe
    pub remote: ConnectPoint,
    /// When the neighbor was first seen on this port.  This is reset if the
    /// record ages out and the neighbor is subsequently rediscovered.
    pub first_seen: DateTime<Utc>,
    /// When we last received a probe from this neighbor
    pub last_seen: DateTime<Utc>,
    /// When the remote endpoint seen on this port last changed
    pub last_changed: DateTime<Utc>,
}

impl NeighborRecord {
    pub fn new(remote: ConnectPoint, now: DateTime<Utc>) -> Self {
        NeighborRecord {
            id: uuid::Uuid::new_v4(),
            remote,
            first_seen: now,
            last_seen: now,
            last_changed: now,
        }
    }
}

/// A single notification for the link store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A probe sent from `src` was received on `dst`.
    Detected { src: ConnectPoint, dst: ConnectPoint },
    /// Whatever link terminated on this port is gone.
    Vanished(ConnectPoint),
    /// Every link terminating on this device is gone.
    DeviceVanished(DeviceId),
}

/// Per-agent counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// How many times a neighbor's record has been deleted because it
    /// stopped refreshing
    pub ageouts_total: u64,
    /// Probes received but not used to update a neighbor record
    pub frames_discarded_total: u64,
    /// Frames that looked like probes but failed to decode
    pub frames_in_errors_total: u64,
    /// Count of all probes delivered to the agent
    pub frames_in_total: u64,
    /// Count of all probes transmitted
    pub frames_out_total: u64,
}

/// Reasons an inbound frame or a lifecycle operation is dropped without
/// effect.  None of these are fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Bad length or crc
    MalformedFrame,
    /// Some other protocol's frame
    NotADiscoveryFrame,
    /// No running agent for the device the frame arrived on
    UnknownIngressDevice,
    /// One of our own probes came back to us
    SelfProbe,
    /// The agent was stopped before the operation reached it
    StaleAgentOperation,
    /// The frame arrived on a port we are not probing
    UntrackedPort,
}

impl DropReason {
    /// Whether the frame was recognized as ours, so that no other consumer
    /// needs to look at it.
    pub fn claims_frame(self) -> bool {
        matches!(self, DropReason::SelfProbe | DropReason::UntrackedPort)
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DropReason::MalformedFrame => "malformed frame",
            DropReason::NotADiscoveryFrame => "not a discovery frame",
            DropReason::UnknownIngressDevice => "unknown ingress device",
            DropReason::SelfProbe => "self probe",
            DropReason::StaleAgentOperation => "stale agent operation",
            DropReason::UntrackedPort => "untracked port",
        };
        write!(f, "{s}")
    }
}
